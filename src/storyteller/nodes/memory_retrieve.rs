//! Hybrid memory retrieval for one chapter.
//!
//! Idempotent: pre-populated memories (from prefetch or a shared
//! step query) are respected. The causal filter is always the
//! chapter's own index.

use crate::retrieval::MemoryQuery;
use crate::storyteller::graph::{GraphContext, GraphError};
use crate::storyteller::state::StorytellerState;

/// Query text: chapter position, mentioned entities, and a bounded
/// prefix of the chapter itself.
pub fn build_query_text(state: &StorytellerState) -> String {
    let head: String = state.chapter_text.chars().take(2000).collect();
    let mut parts = vec![format!("第{}章", state.chapter_idx)];
    parts.extend(state.entities_mentioned.iter().cloned());
    parts.extend(state.locations_mentioned.iter().cloned());
    parts.extend(state.items_mentioned.iter().cloned());
    parts.push(head);
    parts.join(" ")
}

pub fn build_memory_query(state: &StorytellerState) -> MemoryQuery {
    let mut keyword_terms = state.entities_mentioned.clone();
    keyword_terms.extend(state.locations_mentioned.iter().cloned());
    keyword_terms.extend(state.items_mentioned.iter().cloned());
    MemoryQuery {
        book_id: state.book_id,
        query_text: build_query_text(state),
        top_k: state.overrides.memory_top_k,
        current_chapter_idx: Some(state.chapter_idx),
        keyword_terms,
    }
}

pub async fn run(state: &mut StorytellerState, ctx: &GraphContext) -> Result<(), GraphError> {
    if state.awakened_memories.is_some() {
        return Ok(());
    }
    let Some(retriever) = &ctx.memory else {
        state.awakened_memories = Some(Vec::new());
        return Ok(());
    };
    if state.overrides.memory_top_k == 0 {
        state.awakened_memories = Some(Vec::new());
        return Ok(());
    }

    let query = build_memory_query(state);
    match retriever.retrieve(&query).await {
        Ok(hits) => {
            state.awakened_memories = Some(hits);
        }
        Err(err) => {
            log::warn!(
                "Memory retrieval failed chapter_idx={}, continuing without memories: {err}",
                state.chapter_idx
            );
            state.awakened_memories = Some(Vec::new());
        }
    }
    Ok(())
}
