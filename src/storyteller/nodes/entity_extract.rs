//! Entity extraction: LLM-backed with a CJK n-gram fallback.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;

use crate::hashing::{make_cache_key, sha256_text};
use crate::config::schema::EntityExtractMode;
use crate::llm::{LogContext, StructuredSpec};
use crate::storyteller::graph::{GraphContext, GraphError};
use crate::storyteller::prompts::{entity_prompt, ENTITY_PROMPT_VERSION};
use crate::storyteller::state::StorytellerState;

static CJK_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\u{4e00}-\u{9fff}]{2,8}").expect("static regex"));

#[derive(Debug, Default, Deserialize)]
pub struct EntityPayload {
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default)]
    pub key_phrases: Vec<String>,
}

fn unique_capped(values: impl IntoIterator<Item = String>, max_items: usize) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut output = Vec::new();
    for value in values {
        let value = value.trim().to_string();
        if value.is_empty() || !seen.insert(value.clone()) {
            continue;
        }
        output.push(value);
        if output.len() >= max_items {
            break;
        }
    }
    output
}

/// Regex fallback: the unique first CJK n-grams become characters.
fn fallback_characters(text: &str) -> Vec<String> {
    unique_capped(
        CJK_TOKEN.find_iter(text).map(|m| m.as_str().to_string()),
        16,
    )
}

fn entity_schema() -> StructuredSpec {
    StructuredSpec {
        name: "entity_extraction",
        schema: json!({
            "type": "object",
            "properties": {
                "characters": {"type": "array", "items": {"type": "string"}},
                "locations": {"type": "array", "items": {"type": "string"}},
                "items": {"type": "array", "items": {"type": "string"}},
                "key_phrases": {"type": "array", "items": {"type": "string"}},
            },
            "required": ["characters", "locations", "items", "key_phrases"],
            "additionalProperties": false,
        }),
    }
}

pub async fn run(state: &mut StorytellerState, ctx: &GraphContext) -> Result<(), GraphError> {
    let text = state.chapter_text.clone();
    let use_llm = matches!(state.overrides.entity_extract_mode, EntityExtractMode::Llm);

    let client = match (&ctx.entity_llm, use_llm) {
        (Some(client), true) => client.clone(),
        _ => {
            state.entities_mentioned = fallback_characters(&text);
            state.locations_mentioned = Vec::new();
            state.items_mentioned = Vec::new();
            return Ok(());
        }
    };

    let input_hash = sha256_text(&format!(
        "{}::{}::{}::{}",
        state.chapter_id, state.chapter_idx, state.chapter_title, text
    ));
    let cache_key = make_cache_key(&[
        "storyteller_entity",
        &client.model_identifier,
        ENTITY_PROMPT_VERSION,
        &input_hash,
        &format!("{}", ctx.config.storyteller.entity_temperature),
    ]);
    let log_ctx = LogContext::for_node("entity_extract", state.chapter_id, state.chapter_idx)
        .with_input_hash(&input_hash);

    let (system, user) = entity_prompt(&ctx.config.storyteller.language, &text)?;
    match client
        .complete_structured::<EntityPayload>(&system, &user, &cache_key, &entity_schema(), &log_ctx)
        .await
    {
        Ok((response, payload)) => {
            state.entities_mentioned = unique_capped(payload.characters, 16);
            state.locations_mentioned = unique_capped(payload.locations, 16);
            state.items_mentioned = unique_capped(payload.items, 16);
            state.telemetry.entity_llm_calls = 1;
            state.telemetry.entity_llm_cache_hit = response.cached;
            Ok(())
        }
        Err(err) => {
            log::warn!(
                "Entity extraction fallback due to LLM error chapter_idx={}: {err}",
                state.chapter_idx
            );
            state.entities_mentioned = fallback_characters(&text);
            state.locations_mentioned = Vec::new();
            state.items_mentioned = Vec::new();
            state.telemetry.entity_llm_calls = 1;
            state.telemetry.entity_llm_cache_hit = false;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_takes_unique_cjk_ngrams() {
        let text = "韩立出门，韩立回家，墨大夫等待。";
        let characters = fallback_characters(text);
        assert!(characters.contains(&"韩立出门".to_string()));
        assert!(characters.len() <= 16);
        let unique: std::collections::HashSet<_> = characters.iter().collect();
        assert_eq!(unique.len(), characters.len());
    }

    #[test]
    fn unique_capped_trims_and_caps() {
        let values = vec!["  a  ".to_string(), "a".to_string(), "b".to_string(), String::new()];
        assert_eq!(unique_capped(values, 1), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn regex_mode_skips_the_llm() {
        let mut state = StorytellerState {
            chapter_text: "韩立出门。".to_string(),
            ..Default::default()
        };
        state.overrides.entity_extract_mode = EntityExtractMode::Regex;
        let ctx = GraphContext::draft(std::sync::Arc::new(crate::config::AppConfig::default()), 1);
        run(&mut state, &ctx).await.unwrap();
        assert!(!state.entities_mentioned.is_empty());
        assert_eq!(state.telemetry.entity_llm_calls, 0);
    }
}
