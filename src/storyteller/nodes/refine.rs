//! Narration refinement pass.
//!
//! Skipped when the tier disables it or no refine client exists. The
//! refined narration is accepted only when non-empty; otherwise the
//! draft stands.

use serde::Deserialize;
use serde_json::json;

use crate::hashing::{make_cache_key, sha256_text};
use crate::llm::{LogContext, StructuredSpec};
use crate::storyteller::graph::{GraphContext, GraphError};
use crate::storyteller::prompts::{refine_prompt, REFINE_PROMPT_VERSION};
use crate::storyteller::state::{estimate_tokens, StorytellerState};

#[derive(Debug, Default, Deserialize)]
struct RefinePayload {
    #[serde(default)]
    narration: String,
}

fn refine_schema() -> StructuredSpec {
    StructuredSpec {
        name: "narration_refine",
        schema: json!({
            "type": "object",
            "properties": {"narration": {"type": "string"}},
            "required": ["narration"],
            "additionalProperties": false,
        }),
    }
}

pub async fn run(state: &mut StorytellerState, ctx: &GraphContext) -> Result<(), GraphError> {
    let narration = state.narration.trim().to_string();
    if narration.is_empty() {
        return Ok(());
    }

    let input_tokens = estimate_tokens(&narration);
    state.telemetry.refine_input_tokens_estimated = input_tokens;
    state.telemetry.refine_output_tokens_estimated = input_tokens;

    if !state.overrides.refine_enabled {
        return Ok(());
    }
    let Some(client) = ctx.refine_llm.clone() else {
        return Ok(());
    };

    let storyteller = &ctx.config.storyteller;
    let input_hash = {
        let payload = json!({
            "chapter_id": state.chapter_id,
            "chapter_idx": state.chapter_idx,
            "narration": narration,
            "key_events": state.key_events,
            "character_updates": state.character_updates,
            "style": storyteller.style,
        });
        sha256_text(&serde_json::to_string(&payload)?)
    };
    let cache_key = make_cache_key(&[
        "storyteller_refine",
        &client.model_identifier,
        REFINE_PROMPT_VERSION,
        &input_hash,
        &format!("{}", storyteller.refine_temperature),
    ]);
    let log_ctx = LogContext::for_node("refine_narration", state.chapter_id, state.chapter_idx)
        .with_input_hash(&input_hash);

    let (system, user) = refine_prompt(
        &storyteller.language,
        &storyteller.style,
        &serde_json::to_value(&state.key_events)?,
        &serde_json::to_value(&state.character_updates)?,
        &narration,
    )?;

    match client
        .complete_structured::<RefinePayload>(&system, &user, &cache_key, &refine_schema(), &log_ctx)
        .await
    {
        Ok((response, payload)) => {
            let refined = payload.narration.trim().to_string();
            if !refined.is_empty() {
                state.narration = refined;
            }
            state.telemetry.refine_llm_calls = 1;
            state.telemetry.refine_llm_cache_hit = response.cached;
            state.telemetry.refine_output_tokens_estimated = estimate_tokens(&state.narration);
            Ok(())
        }
        Err(err) => {
            log::warn!(
                "Narration refine fallback due to LLM error chapter_idx={}: {err}",
                state.chapter_idx
            );
            state.telemetry.refine_llm_calls = 1;
            state.telemetry.refine_llm_cache_hit = false;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn disabled_refine_keeps_the_draft() {
        let mut state = StorytellerState {
            narration: "草稿".to_string(),
            ..Default::default()
        };
        state.overrides.refine_enabled = false;
        let ctx = GraphContext::draft(Arc::new(crate::config::AppConfig::default()), 1);
        run(&mut state, &ctx).await.unwrap();
        assert_eq!(state.narration, "草稿");
        assert_eq!(state.telemetry.refine_llm_calls, 0);
        assert!(state.telemetry.refine_input_tokens_estimated > 0);
    }

    #[tokio::test]
    async fn empty_narration_is_a_noop() {
        let mut state = StorytellerState::default();
        state.overrides.refine_enabled = true;
        let ctx = GraphContext::draft(Arc::new(crate::config::AppConfig::default()), 1);
        run(&mut state, &ctx).await.unwrap();
        assert_eq!(state.telemetry.refine_input_tokens_estimated, 0);
    }
}
