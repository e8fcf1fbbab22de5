//! World-state lookup for the entities the chapter mentions.

use crate::storyteller::graph::{GraphContext, GraphError};
use crate::storyteller::state::StorytellerState;

pub fn run(state: &mut StorytellerState, ctx: &GraphContext) -> Result<(), GraphError> {
    let store = ctx
        .store
        .as_ref()
        .ok_or(GraphError::MissingDependency("store"))?;

    let entity_filter = non_empty(&state.entities_mentioned);
    let item_filter = non_empty(&state.items_mentioned);
    let window = ctx.config.storyteller.recent_events_window;

    let (characters, items, recent_events) = store.read(|sess| {
        let characters = sess.list_character_states(ctx.book_id, entity_filter)?;
        let items = sess.list_item_states(ctx.book_id, item_filter)?;
        let recent_events =
            sess.list_recent_plot_events(ctx.book_id, Some(state.chapter_idx), window, 20)?;
        Ok((characters, items, recent_events))
    })?;

    state.character_states = characters;
    state.item_states = items;
    state.recent_events = recent_events;
    Ok(())
}

fn non_empty(names: &[String]) -> Option<&[String]> {
    if names.is_empty() {
        None
    } else {
        Some(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::world_state::CharacterUpsert;
    use crate::storage::Store;
    use std::sync::Arc;

    #[tokio::test]
    async fn lookup_filters_by_mentioned_entities() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let book_id = store
            .session(|sess| {
                let book = sess.get_or_create_book(None, None, "bh", "x")?;
                for name in ["韩立", "墨大夫"] {
                    sess.upsert_character_state(
                        book.id,
                        &CharacterUpsert {
                            canonical_name: name.into(),
                            ..Default::default()
                        },
                    )?;
                }
                sess.insert_plot_event(book.id, 1, "入门七玄门", None, None, None)?;
                sess.insert_plot_event(book.id, 9, "远未来事件", None, None, None)?;
                Ok(book.id)
            })
            .unwrap();

        let mut ctx = GraphContext::draft(Arc::new(crate::config::AppConfig::default()), book_id);
        ctx.store = Some(store);
        let mut state = StorytellerState {
            book_id,
            chapter_idx: 3,
            entities_mentioned: vec!["韩立".to_string()],
            ..Default::default()
        };
        run(&mut state, &ctx).unwrap();
        assert_eq!(state.character_states.len(), 1);
        assert_eq!(state.character_states[0].canonical_name, "韩立");
        assert_eq!(state.recent_events.len(), 1);
        assert_eq!(state.recent_events[0].event_summary, "入门七玄门");
    }

    #[tokio::test]
    async fn missing_store_is_a_dependency_error() {
        let ctx = GraphContext::draft(Arc::new(crate::config::AppConfig::default()), 1);
        let mut state = StorytellerState::default();
        assert!(matches!(
            run(&mut state, &ctx),
            Err(GraphError::MissingDependency("store"))
        ));
    }
}
