//! Narration generation for a single chapter.
//!
//! With no LLM (or on final failure) the node degrades to a
//! deterministic draft: the first `ceil(len · ratio.high)` characters
//! of the chapter plus one synthesized key event, so downstream
//! nodes always have something to verify and commit.

use serde::Deserialize;
use serde_json::json;

use crate::hashing::{make_cache_key, sha256_text};
use crate::llm::{LogContext, StructuredSpec};
use crate::storyteller::graph::{GraphContext, GraphError};
use crate::storyteller::prompts::{narration_prompt, NARRATION_PROMPT_VERSION};
use crate::storyteller::state::{
    estimate_tokens, CharacterUpdate, KeyEvent, NewItem, StorytellerState,
};

#[derive(Debug, Default, Deserialize)]
pub struct GeneratePayload {
    #[serde(default)]
    pub narration: String,
    #[serde(default)]
    pub key_events: Vec<KeyEvent>,
    #[serde(default)]
    pub character_updates: Vec<CharacterUpdate>,
    #[serde(default)]
    pub new_items: Vec<NewItem>,
}

/// Deterministic draft: a character-prefix of the chapter.
pub fn draft_narration(text: &str, ratio: (f64, f64)) -> String {
    if text.is_empty() {
        return String::new();
    }
    let total = text.chars().count();
    let target = ((total as f64) * ratio.1).ceil().max(1.0) as usize;
    text.chars().take(target).collect::<String>().trim().to_string()
}

fn placeholder_event(chapter_idx: i64, outcome: &str, impact: &str) -> KeyEvent {
    KeyEvent {
        who: "unknown".to_string(),
        what: format!("Chapter {chapter_idx} draft narration generated"),
        where_: "unknown".to_string(),
        outcome: outcome.to_string(),
        impact: impact.to_string(),
        ..Default::default()
    }
}

fn generation_schema() -> StructuredSpec {
    let string_array_of = |properties: serde_json::Value, required: serde_json::Value| {
        json!({"type": "array", "items": {
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        }})
    };
    StructuredSpec {
        name: "chapter_narration",
        schema: json!({
            "type": "object",
            "properties": {
                "narration": {"type": "string"},
                "key_events": string_array_of(
                    json!({
                        "who": {"type": "string"},
                        "what": {"type": "string"},
                        "where": {"type": "string"},
                        "outcome": {"type": "string"},
                        "impact": {"type": "string"},
                    }),
                    json!(["who", "what", "where", "outcome", "impact"]),
                ),
                "character_updates": string_array_of(
                    json!({
                        "name": {"type": "string"},
                        "change_type": {"type": "string"},
                        "before": {"type": "string"},
                        "after": {"type": "string"},
                        "evidence": {"type": "string"},
                    }),
                    json!(["name", "change_type", "before", "after", "evidence"]),
                ),
                "new_items": string_array_of(
                    json!({
                        "name": {"type": "string"},
                        "owner": {"type": "string"},
                        "description": {"type": "string"},
                    }),
                    json!(["name", "owner", "description"]),
                ),
            },
            "required": ["narration", "key_events", "character_updates", "new_items"],
            "additionalProperties": false,
        }),
    }
}

/// Hash of everything that influences this chapter's generation.
pub fn generation_input_hash(state: &StorytellerState, style: &str) -> Result<String, GraphError> {
    let payload = json!({
        "chapter_id": state.chapter_id,
        "chapter_idx": state.chapter_idx,
        "chapter_title": state.chapter_title,
        "chapter_text": state.chapter_text,
        "character_states": state.character_states,
        "item_states": state.item_states,
        "recent_events": state.recent_events,
        "awakened_memories": state.memories(),
        "style": style,
        "ratio": [state.overrides.narration_ratio.0, state.overrides.narration_ratio.1],
    });
    Ok(sha256_text(&serde_json::to_string(&payload)?))
}

fn fill_fallback(state: &mut StorytellerState, llm_calls: u32) {
    let ratio = state.overrides.narration_ratio;
    let narration = draft_narration(&state.chapter_text, ratio);
    state.key_events = if narration.is_empty() {
        Vec::new()
    } else {
        vec![placeholder_event(
            state.chapter_idx,
            "draft_generated",
            "world_state_pending",
        )]
    };
    state.telemetry.narration_llm_calls = llm_calls;
    state.telemetry.narration_llm_cache_hit = false;
    state.telemetry.input_tokens_estimated = estimate_tokens(&state.chapter_text);
    state.telemetry.output_tokens_estimated = estimate_tokens(&narration);
    state.narration = narration;
    state.character_updates = Vec::new();
    state.new_items = Vec::new();
}

pub async fn run(state: &mut StorytellerState, ctx: &GraphContext) -> Result<(), GraphError> {
    let Some(client) = ctx.narration_llm.clone() else {
        fill_fallback(state, 0);
        return Ok(());
    };

    let storyteller = &ctx.config.storyteller;
    let input_hash = generation_input_hash(state, &storyteller.style)?;
    let cache_key = make_cache_key(&[
        "storyteller_generate",
        &client.model_identifier,
        NARRATION_PROMPT_VERSION,
        &input_hash,
        &format!("{}", storyteller.narration_temperature),
    ]);
    let log_ctx = LogContext::for_node("storyteller_generate", state.chapter_id, state.chapter_idx)
        .with_input_hash(&input_hash);
    log::debug!(
        "Invoking storyteller narration generation chapter_idx={} cache_key={} input_hash={}",
        state.chapter_idx,
        crate::hashing::short_hash(&cache_key),
        crate::hashing::short_hash(&input_hash)
    );

    let (system, user) = narration_prompt(
        &storyteller.language,
        &storyteller.style,
        state.overrides.narration_ratio,
        state.overrides.include_key_dialogue,
        state.overrides.include_inner_thoughts,
        &state.chapter_title,
        &state.chapter_text,
        &serde_json::to_value(&state.character_states)?,
        &serde_json::to_value(&state.item_states)?,
        &serde_json::to_value(&state.recent_events)?,
        &serde_json::to_value(state.memories())?,
    )?;

    match client
        .complete_structured::<GeneratePayload>(
            &system,
            &user,
            &cache_key,
            &generation_schema(),
            &log_ctx,
        )
        .await
    {
        Ok((response, payload)) => {
            let narration = payload.narration.trim().to_string();
            state.narration = if narration.is_empty() {
                draft_narration(&state.chapter_text, state.overrides.narration_ratio)
            } else {
                narration
            };
            state.key_events = payload.key_events;
            state.character_updates = payload.character_updates;
            state.new_items = payload.new_items;
            if state.key_events.is_empty() && !state.narration.is_empty() {
                state.key_events = vec![placeholder_event(
                    state.chapter_idx,
                    "generated",
                    "state_update_pending",
                )];
            }
            state.telemetry.narration_llm_calls = 1;
            state.telemetry.narration_llm_cache_hit = response.cached;
            state.telemetry.input_tokens_estimated = estimate_tokens(&state.chapter_text);
            state.telemetry.output_tokens_estimated = estimate_tokens(&state.narration);
            Ok(())
        }
        Err(err) => {
            log::warn!(
                "Storyteller generation fallback due to LLM error chapter_idx={}: {err}",
                state.chapter_idx
            );
            fill_fallback(state, 1);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn draft_takes_ceil_of_high_ratio() {
        assert_eq!(draft_narration("abcdefghij", (0.2, 0.45)), "abcde");
        assert_eq!(draft_narration("", (0.2, 0.45)), "");
        // Always at least one character.
        assert_eq!(draft_narration("ab", (0.1, 0.2)), "a");
    }

    #[tokio::test]
    async fn no_client_produces_draft_and_placeholder_event() {
        let mut state = StorytellerState {
            chapter_idx: 4,
            chapter_text: "韩立在洞府中修炼青元剑诀。".to_string(),
            ..Default::default()
        };
        state.overrides.narration_ratio = (0.4, 0.5);
        let ctx = GraphContext::draft(Arc::new(crate::config::AppConfig::default()), 1);
        run(&mut state, &ctx).await.unwrap();
        assert!(!state.narration.is_empty());
        assert_eq!(state.key_events.len(), 1);
        assert_eq!(state.key_events[0].outcome, "draft_generated");
        assert_eq!(state.telemetry.narration_llm_calls, 0);
        assert!(state.telemetry.output_tokens_estimated > 0);
    }

    #[test]
    fn input_hash_reacts_to_every_ingredient() {
        let mut state = StorytellerState {
            chapter_id: 1,
            chapter_idx: 1,
            chapter_text: "正文".to_string(),
            ..Default::default()
        };
        let base = generation_input_hash(&state, "评书").unwrap();
        assert_ne!(base, generation_input_hash(&state, "其他风格").unwrap());
        state.chapter_text.push('！');
        assert_ne!(base, generation_input_hash(&state, "评书").unwrap());
    }
}
