//! Step-aggregate generation: one LLM call for a whole step of
//! chapters, conditioned on the shared baseline world-state.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::AppConfig;
use crate::hashing::make_cache_key;
use crate::llm::{LlmClient, LogContext, StructuredSpec};
use crate::storyteller::graph::GraphError;
use crate::storyteller::nodes::generate::draft_narration;
use crate::storyteller::prompts::{step_narration_prompt, STEP_NARRATION_PROMPT_VERSION};
use crate::storyteller::state::{
    estimate_tokens, CharacterUpdate, KeyEvent, NewItem, StorytellerState,
};

#[derive(Debug, Default, Deserialize)]
struct StepPayload {
    #[serde(default)]
    step_start_chapter_idx: Option<i64>,
    #[serde(default)]
    step_end_chapter_idx: Option<i64>,
    #[serde(default)]
    narration: String,
    #[serde(default)]
    key_events: Vec<KeyEvent>,
    #[serde(default)]
    character_updates: Vec<CharacterUpdate>,
    #[serde(default)]
    new_items: Vec<NewItem>,
}

#[derive(Debug, Clone, Default)]
pub struct StepGenerateOutput {
    pub step_start_chapter_idx: i64,
    pub step_end_chapter_idx: i64,
    pub narration: String,
    pub key_events: Vec<KeyEvent>,
    pub character_updates: Vec<CharacterUpdate>,
    pub new_items: Vec<NewItem>,
    pub entities_mentioned: Vec<String>,
    pub llm_calls: u32,
    pub cache_hit: bool,
    pub input_tokens_estimated: u64,
    pub output_tokens_estimated: u64,
}

fn merge_entities(states: &[&StorytellerState]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut merged = Vec::new();
    for state in states {
        for entity in &state.entities_mentioned {
            let entity = entity.trim().to_string();
            if !entity.is_empty() && seen.insert(entity.clone()) {
                merged.push(entity);
            }
        }
    }
    merged
}

/// Chapter payloads exactly as the prompt consumes them; also the
/// hashable description of the step's inputs.
pub fn chapters_payload(states: &[&StorytellerState]) -> Result<Value, GraphError> {
    let mut chapters = Vec::with_capacity(states.len());
    for state in states {
        chapters.push(json!({
            "chapter_idx": state.chapter_idx,
            "chapter_title": state.chapter_title,
            "chapter_text": state.chapter_text,
            "awakened_memories": state.memories(),
            "constraints": {
                "narration_ratio": [state.overrides.narration_ratio.0, state.overrides.narration_ratio.1],
                "include_key_dialogue": state.overrides.include_key_dialogue,
                "include_inner_thoughts": state.overrides.include_inner_thoughts,
            },
        }));
    }
    Ok(Value::Array(chapters))
}

fn step_schema() -> StructuredSpec {
    StructuredSpec {
        name: "step_narration",
        schema: json!({
            "type": "object",
            "properties": {
                "step_start_chapter_idx": {"type": "integer"},
                "step_end_chapter_idx": {"type": "integer"},
                "narration": {"type": "string"},
                "key_events": {"type": "array"},
                "character_updates": {"type": "array"},
                "new_items": {"type": "array"},
            },
            "required": [
                "step_start_chapter_idx",
                "step_end_chapter_idx",
                "narration",
                "key_events",
                "character_updates",
                "new_items",
            ],
        }),
    }
}

/// Generate one aggregated narration for a step worth of chapters.
pub async fn run_batch(
    states: &[StorytellerState],
    config: &AppConfig,
    client: Option<&LlmClient>,
    base_world_state: &Value,
    input_hash: &str,
) -> Result<StepGenerateOutput, GraphError> {
    if states.is_empty() {
        return Ok(StepGenerateOutput::default());
    }

    let mut ordered: Vec<&StorytellerState> = states.iter().collect();
    ordered.sort_by_key(|state| state.chapter_idx);
    let step_start = ordered[0].chapter_idx;
    let step_end = ordered[ordered.len() - 1].chapter_idx;

    let combined_text = ordered
        .iter()
        .map(|state| state.chapter_text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let ratio = ordered[0].overrides.narration_ratio;
    let fallback = draft_narration(&combined_text, ratio);
    let entities = merge_entities(&ordered);

    let Some(client) = client else {
        return Ok(StepGenerateOutput {
            step_start_chapter_idx: step_start,
            step_end_chapter_idx: step_end,
            output_tokens_estimated: estimate_tokens(&fallback),
            input_tokens_estimated: estimate_tokens(&combined_text),
            narration: fallback,
            entities_mentioned: entities,
            ..Default::default()
        });
    };

    let storyteller = &config.storyteller;
    let cache_key = make_cache_key(&[
        "storyteller_generate_step",
        &client.model_identifier,
        STEP_NARRATION_PROMPT_VERSION,
        input_hash,
        &format!("{}", storyteller.narration_temperature),
    ]);
    let log_ctx = LogContext {
        node: Some("storyteller_generate_step".to_string()),
        chapter_id: None,
        chapter_idx: Some(format!("{step_start}-{step_end}")),
        input_hash: Some(input_hash.to_string()),
    };
    log::debug!(
        "Invoking step narration generation batch_size={} cache_key={} input_hash={}",
        ordered.len(),
        crate::hashing::short_hash(&cache_key),
        crate::hashing::short_hash(input_hash)
    );

    let chapters = chapters_payload(&ordered)?;
    let (system, user) = step_narration_prompt(
        &storyteller.language,
        &storyteller.style,
        step_start,
        step_end,
        base_world_state,
        &chapters,
    )?;

    match client
        .complete_structured::<StepPayload>(&system, &user, &cache_key, &step_schema(), &log_ctx)
        .await
    {
        Ok((response, payload)) => {
            let narration = {
                let text = payload.narration.trim().to_string();
                if text.is_empty() {
                    fallback
                } else {
                    text
                }
            };
            Ok(StepGenerateOutput {
                step_start_chapter_idx: payload.step_start_chapter_idx.unwrap_or(step_start),
                step_end_chapter_idx: payload.step_end_chapter_idx.unwrap_or(step_end),
                key_events: payload.key_events,
                character_updates: payload.character_updates,
                new_items: payload.new_items,
                entities_mentioned: entities,
                llm_calls: 1,
                cache_hit: response.cached,
                input_tokens_estimated: estimate_tokens(&combined_text),
                output_tokens_estimated: estimate_tokens(&narration),
                narration,
            })
        }
        Err(err) => {
            log::warn!(
                "Step aggregate generation failed chapter_idx={step_start}-{step_end}, fallback to draft narration: {err}"
            );
            Ok(StepGenerateOutput {
                step_start_chapter_idx: step_start,
                step_end_chapter_idx: step_end,
                entities_mentioned: entities,
                llm_calls: 1,
                cache_hit: false,
                input_tokens_estimated: estimate_tokens(&combined_text),
                output_tokens_estimated: estimate_tokens(&fallback),
                narration: fallback,
                ..Default::default()
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chapter_state(idx: i64, text: &str) -> StorytellerState {
        let mut state = StorytellerState {
            chapter_idx: idx,
            chapter_title: format!("第{idx}章"),
            chapter_text: text.to_string(),
            entities_mentioned: vec!["韩立".to_string(), format!("配角{idx}")],
            ..Default::default()
        };
        state.overrides.narration_ratio = (0.4, 0.5);
        state
    }

    #[tokio::test]
    async fn fallback_aggregates_in_chapter_order() {
        let states = vec![chapter_state(2, "第二章正文"), chapter_state(1, "第一章正文")];
        let output = run_batch(&states, &AppConfig::default(), None, &json!({}), "hash")
            .await
            .unwrap();
        assert_eq!(output.step_start_chapter_idx, 1);
        assert_eq!(output.step_end_chapter_idx, 2);
        assert!(output.narration.starts_with("第一章正文"));
        assert_eq!(output.llm_calls, 0);
        // 韩立 deduplicated across chapters, per-chapter extras kept.
        assert_eq!(
            output.entities_mentioned,
            vec!["韩立", "配角1", "配角2"]
        );
    }

    #[tokio::test]
    async fn empty_batch_is_empty_output() {
        let output = run_batch(&[], &AppConfig::default(), None, &json!({}), "hash")
            .await
            .unwrap();
        assert_eq!(output.step_start_chapter_idx, 0);
        assert!(output.narration.is_empty());
    }
}
