//! The single writer: commits verified claims into world-state.
//!
//! Everything happens inside one store session. When the context
//! carries a `NarrationMeta`, the chapter's narration row and its
//! structured sidecar are persisted in the same transaction, so a
//! failure anywhere rolls back the whole chapter.

use crate::hashing::sha256_text;
use crate::storage::world_state::{CharacterUpsert, ItemUpsert};
use crate::storage::{Session, StoreResult};
use crate::storyteller::graph::{GraphContext, GraphError};
use crate::storyteller::state::{
    CharacterUpdate, KeyEvent, MutationSummary, NewItem, StorytellerState,
};

/// The verified claim set to commit for one chapter (or one step
/// anchored at `chapter_idx`).
pub struct StateMutations<'a> {
    pub key_events: &'a [KeyEvent],
    pub character_updates: &'a [CharacterUpdate],
    pub new_items: &'a [NewItem],
    pub entities_mentioned: &'a [String],
}

fn event_fact_key(chapter_idx: i64, what: &str) -> String {
    let digest = sha256_text(what);
    format!("event:{chapter_idx}:{}", &digest[..12])
}

/// Apply the claim set. Used by the chapter graph, the step
/// executor, and cached-payload replay.
pub fn apply(
    sess: &Session<'_>,
    book_id: i64,
    chapter_idx: i64,
    mutations: &StateMutations<'_>,
) -> StoreResult<MutationSummary> {
    let mut summary = MutationSummary::default();

    for event in mutations.key_events {
        let what = event.what.trim();
        if what.is_empty() {
            continue;
        }
        let involved_json = if event.who.trim().is_empty() {
            None
        } else {
            Some(serde_json::to_string(&[event.who.trim()])?)
        };
        sess.insert_plot_event(
            book_id,
            chapter_idx,
            what,
            involved_json.as_deref(),
            Some("narration"),
            Some(event.impact.trim()).filter(|s| !s.is_empty()),
        )?;
        summary.plot_events_inserted += 1;

        sess.upsert_world_fact(
            book_id,
            &event_fact_key(chapter_idx, what),
            what,
            0.7,
            Some(chapter_idx),
            None,
        )?;
        summary.world_facts_upserted += 1;
    }

    for entity in mutations.entities_mentioned {
        let name = entity.trim();
        if name.is_empty() {
            continue;
        }
        let upsert = match sess.find_character_state(book_id, name)? {
            Some(existing) => CharacterUpsert {
                canonical_name: existing.canonical_name.clone(),
                aliases: existing.aliases(),
                first_chapter_idx: existing.first_chapter_idx.or(Some(chapter_idx)),
                last_chapter_idx: Some(existing.last_chapter_idx.unwrap_or(chapter_idx).max(chapter_idx)),
                status: existing.status,
                location: existing.location,
                abilities_json: existing.abilities_json,
                relationships_json: existing.relationships_json,
                motivation: existing.motivation,
                notes: existing.notes,
            },
            None => CharacterUpsert {
                canonical_name: name.to_string(),
                first_chapter_idx: Some(chapter_idx),
                last_chapter_idx: Some(chapter_idx),
                ..Default::default()
            },
        };
        sess.upsert_character_state(book_id, &upsert)?;
        summary.characters_upserted += 1;
    }

    for update in mutations.character_updates {
        let name = update.name.trim();
        if name.is_empty() {
            continue;
        }
        let mut upsert = match sess.find_character_state(book_id, name)? {
            Some(existing) => CharacterUpsert {
                canonical_name: existing.canonical_name.clone(),
                aliases: existing.aliases(),
                first_chapter_idx: existing.first_chapter_idx.or(Some(chapter_idx)),
                last_chapter_idx: Some(existing.last_chapter_idx.unwrap_or(chapter_idx).max(chapter_idx)),
                status: existing.status,
                location: existing.location,
                abilities_json: existing.abilities_json,
                relationships_json: existing.relationships_json,
                motivation: existing.motivation,
                notes: existing.notes,
            },
            None => CharacterUpsert {
                canonical_name: name.to_string(),
                first_chapter_idx: Some(chapter_idx),
                last_chapter_idx: Some(chapter_idx),
                ..Default::default()
            },
        };

        let after = update.after.trim();
        match update.change_type.as_str() {
            "status" if !after.is_empty() => {
                upsert.status = after.to_string();
                sess.upsert_world_fact(
                    book_id,
                    &format!("character:{name}:status"),
                    after,
                    0.85,
                    Some(chapter_idx),
                    Some(update.evidence.trim()).filter(|s| !s.is_empty()),
                )?;
                summary.world_facts_upserted += 1;
            }
            "location" if !after.is_empty() => {
                upsert.location = Some(after.to_string());
                sess.upsert_world_fact(
                    book_id,
                    &format!("character:{name}:location"),
                    after,
                    0.8,
                    Some(chapter_idx),
                    Some(update.evidence.trim()).filter(|s| !s.is_empty()),
                )?;
                summary.world_facts_upserted += 1;
            }
            _ => {}
        }

        sess.upsert_character_state(book_id, &upsert)?;
        summary.characters_upserted += 1;
    }

    for item in mutations.new_items {
        let name = item.name.trim();
        if name.is_empty() {
            continue;
        }
        let owner = Some(item.owner.trim().to_string()).filter(|s| !s.is_empty());
        let description = Some(item.description.trim().to_string()).filter(|s| !s.is_empty());
        let upsert = match sess.find_item_state(book_id, name)? {
            Some(existing) => ItemUpsert {
                name: existing.name.clone(),
                owner_name: owner.clone().or(existing.owner_name),
                first_chapter_idx: existing.first_chapter_idx.or(Some(chapter_idx)),
                last_chapter_idx: Some(existing.last_chapter_idx.unwrap_or(chapter_idx).max(chapter_idx)),
                description: description.clone().or(existing.description),
                status: existing.status,
            },
            None => ItemUpsert {
                name: name.to_string(),
                owner_name: owner.clone(),
                first_chapter_idx: Some(chapter_idx),
                last_chapter_idx: Some(chapter_idx),
                description: description.clone(),
                ..Default::default()
            },
        };
        sess.upsert_item_state(book_id, &upsert)?;
        summary.items_upserted += 1;

        if let Some(owner) = owner {
            sess.upsert_world_fact(
                book_id,
                &format!("item:{name}:owner"),
                &owner,
                0.75,
                Some(chapter_idx),
                None,
            )?;
            summary.world_facts_upserted += 1;
        }
    }

    Ok(summary)
}

pub fn run(state: &mut StorytellerState, ctx: &GraphContext) -> Result<(), GraphError> {
    let store = ctx
        .store
        .as_ref()
        .ok_or(GraphError::MissingDependency("store"))?;

    let mutations = StateMutations {
        key_events: &state.key_events,
        character_updates: &state.character_updates,
        new_items: &state.new_items,
        entities_mentioned: &state.entities_mentioned,
    };

    let narration_meta = ctx.narration_meta.clone();
    let narration_text = state.narration.trim().to_string();
    let key_events_json = serde_json::to_string(&state.key_events)?;
    let payload_json = serde_json::to_string(&state.payload())?;
    let (book_id, chapter_id, chapter_idx) = (ctx.book_id, state.chapter_id, state.chapter_idx);

    let summary = store.session(|sess| {
        let mut summary = apply(sess, book_id, chapter_idx, &mutations)?;

        if let Some(meta) = &narration_meta {
            if narration_text.is_empty() {
                log::warn!(
                    "No narration generated chapter_id={chapter_id} chapter_idx={chapter_idx}; narration row skipped"
                );
                return Ok(summary);
            }
            let narration = sess.upsert_narration(
                book_id,
                chapter_id,
                chapter_idx,
                &narration_text,
                Some(&key_events_json),
                &meta.prompt_version,
                &meta.model,
                &meta.input_hash,
            )?;
            sess.upsert_narration_output(
                narration.id,
                book_id,
                chapter_id,
                chapter_idx,
                &meta.prompt_version,
                &meta.model,
                &meta.input_hash,
                &payload_json,
            )?;
            summary.narration_persisted = narration.inserted;
        }
        Ok(summary)
    })?;

    state.mutations_applied = Some(summary);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;
    use crate::storyteller::graph::NarrationMeta;
    use std::sync::Arc;

    fn seeded() -> (Arc<Store>, i64) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let book_id = store
            .session(|sess| Ok(sess.get_or_create_book(None, None, "bh", "x")?.id))
            .unwrap();
        (store, book_id)
    }

    fn verified_state(book_id: i64, chapter_id: i64) -> StorytellerState {
        StorytellerState {
            book_id,
            chapter_id,
            chapter_idx: 3,
            narration: "说书稿正文".to_string(),
            entities_mentioned: vec!["韩立".to_string()],
            key_events: vec![KeyEvent {
                who: "韩立".into(),
                what: "获得掌天瓶".into(),
                impact: "修炼速度大增".into(),
                ..Default::default()
            }],
            character_updates: vec![CharacterUpdate {
                name: "韩立".into(),
                change_type: "status".into(),
                before: "炼气".into(),
                after: "筑基".into(),
                ..Default::default()
            }],
            new_items: vec![NewItem {
                name: "掌天瓶".into(),
                owner: "韩立".into(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn commits_events_characters_items_and_facts() {
        let (store, book_id) = seeded();
        let chapter_id = store
            .session(|sess| Ok(sess.upsert_chapter(book_id, 3, "第3章", "c3", 0, 0)?.id))
            .unwrap();
        let mut state = verified_state(book_id, chapter_id);
        let mut ctx = GraphContext::draft(Arc::new(crate::config::AppConfig::default()), book_id);
        ctx.store = Some(store.clone());

        run(&mut state, &ctx).unwrap();
        let summary = state.mutations_applied.unwrap();
        assert_eq!(summary.plot_events_inserted, 1);
        assert_eq!(summary.items_upserted, 1);
        // event fact + status fact + owner fact
        assert_eq!(summary.world_facts_upserted, 3);

        store
            .read(|sess| {
                let character = sess.find_character_state(book_id, "韩立")?.unwrap();
                assert_eq!(character.status, "筑基");
                assert_eq!(character.last_chapter_idx, Some(3));

                let item = sess.find_item_state(book_id, "掌天瓶")?.unwrap();
                assert_eq!(item.owner_name.as_deref(), Some("韩立"));

                let status_fact = sess.find_world_fact(book_id, "character:韩立:status")?.unwrap();
                assert_eq!(status_fact.fact_value, "筑基");
                assert_eq!(status_fact.confidence, 0.85);
                let owner_fact = sess.find_world_fact(book_id, "item:掌天瓶:owner")?.unwrap();
                assert_eq!(owner_fact.confidence, 0.75);

                let events = sess.list_plot_events_by_book(book_id)?;
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].event_summary, "获得掌天瓶");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn persists_narration_and_payload_in_the_same_session() {
        let (store, book_id) = seeded();
        let chapter_id = store
            .session(|sess| Ok(sess.upsert_chapter(book_id, 3, "第3章", "c3", 0, 0)?.id))
            .unwrap();
        let mut state = verified_state(book_id, chapter_id);
        let mut ctx = GraphContext::draft(Arc::new(crate::config::AppConfig::default()), book_id);
        ctx.store = Some(store.clone());
        ctx.narration_meta = Some(NarrationMeta {
            prompt_version: "v2-narration".into(),
            model: "m".into(),
            input_hash: "h".into(),
        });

        run(&mut state, &ctx).unwrap();
        assert!(state.mutations_applied.unwrap().narration_persisted);

        store
            .read(|sess| {
                let narration = sess.get_narration(chapter_id, "v2-narration", "m", "h")?.unwrap();
                let output = sess.get_narration_output(narration.id)?.unwrap();
                let payload: crate::storyteller::state::NarrationPayload =
                    serde_json::from_str(&output.payload_json)?;
                assert_eq!(payload.key_events.len(), 1);
                assert_eq!(payload.entities_mentioned, vec!["韩立".to_string()]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn empty_narration_commits_state_but_skips_the_row() {
        let (store, book_id) = seeded();
        let chapter_id = store
            .session(|sess| Ok(sess.upsert_chapter(book_id, 3, "第3章", "c3", 0, 0)?.id))
            .unwrap();
        let mut state = verified_state(book_id, chapter_id);
        state.narration = String::new();
        let mut ctx = GraphContext::draft(Arc::new(crate::config::AppConfig::default()), book_id);
        ctx.store = Some(store.clone());
        ctx.narration_meta = Some(NarrationMeta {
            prompt_version: "v".into(),
            model: "m".into(),
            input_hash: "h".into(),
        });

        run(&mut state, &ctx).unwrap();
        assert!(!state.mutations_applied.unwrap().narration_persisted);
        store
            .read(|sess| {
                assert_eq!(sess.list_plot_events_by_book(book_id)?.len(), 1);
                assert!(sess.get_latest_narration(chapter_id)?.is_none());
                Ok(())
            })
            .unwrap();
    }
}
