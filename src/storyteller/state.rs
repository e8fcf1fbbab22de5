//! The storyteller state bag.
//!
//! One owned record travels through the chapter DAG by mutable
//! reference. Fields are sparse: each node fills what it owns and
//! reads what earlier nodes produced. Across chapters the state is
//! rebuilt from the store, never shared.

use serde::{Deserialize, Serialize};

use crate::config::schema::{Tier, TierProfile};
use crate::retrieval::MemoryHit;
use crate::storage::{CharacterRow, ItemRow, PlotEventRow, WorldFactRow};

/// A key event claimed by the generation step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KeyEvent {
    #[serde(default)]
    pub who: String,
    #[serde(default)]
    pub what: String,
    #[serde(default, rename = "where")]
    pub where_: String,
    #[serde(default)]
    pub outcome: String,
    #[serde(default)]
    pub impact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_source_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_quote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_score: Option<f64>,
}

/// A claimed change to a character.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CharacterUpdate {
    #[serde(default)]
    pub name: String,
    /// The name as the model wrote it, before alias normalization.
    #[serde(default)]
    pub name_raw: String,
    #[serde(default)]
    pub change_type: String,
    #[serde(default)]
    pub before: String,
    #[serde(default)]
    pub after: String,
    #[serde(default)]
    pub evidence: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_source_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_quote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_score: Option<f64>,
}

/// A newly introduced item.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewItem {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_source_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_quote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_score: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvidenceReport {
    pub total_claims: usize,
    pub supported_claims: usize,
    pub unsupported_claims: usize,
}

/// Per-chapter LLM call and token accounting.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Telemetry {
    pub entity_llm_calls: u32,
    pub entity_llm_cache_hit: bool,
    pub narration_llm_calls: u32,
    pub narration_llm_cache_hit: bool,
    pub refine_llm_calls: u32,
    pub refine_llm_cache_hit: bool,
    pub input_tokens_estimated: u64,
    pub output_tokens_estimated: u64,
    pub refine_input_tokens_estimated: u64,
    pub refine_output_tokens_estimated: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MutationSummary {
    pub plot_events_inserted: usize,
    pub characters_upserted: usize,
    pub items_upserted: usize,
    pub world_facts_upserted: usize,
    pub narration_persisted: bool,
}

/// The structured sidecar persisted next to each narration, replayed
/// during world-state rebuild.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NarrationPayload {
    #[serde(default)]
    pub entities_mentioned: Vec<String>,
    #[serde(default)]
    pub key_events: Vec<KeyEvent>,
    #[serde(default)]
    pub character_updates: Vec<CharacterUpdate>,
    #[serde(default)]
    pub new_items: Vec<NewItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_start_chapter_idx: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_end_chapter_idx: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorytellerState {
    // Inputs.
    pub book_id: i64,
    pub chapter_id: i64,
    pub chapter_idx: i64,
    pub chapter_title: String,
    pub chapter_text: String,
    pub tier: Tier,
    /// Tier-effective knobs for this chapter.
    pub overrides: TierProfile,

    // entity_extract.
    pub entities_mentioned: Vec<String>,
    pub locations_mentioned: Vec<String>,
    pub items_mentioned: Vec<String>,

    // state_lookup.
    pub character_states: Vec<CharacterRow>,
    pub item_states: Vec<ItemRow>,
    pub recent_events: Vec<PlotEventRow>,
    pub world_facts: Vec<WorldFactRow>,

    // memory_retrieve. `None` means not attempted yet; a pre-populated
    // value is respected (the node is idempotent).
    pub awakened_memories: Option<Vec<MemoryHit>>,

    // storyteller_generate and later filters.
    pub narration: String,
    pub key_events: Vec<KeyEvent>,
    pub character_updates: Vec<CharacterUpdate>,
    pub new_items: Vec<NewItem>,
    pub consistency_warnings: Vec<String>,
    pub consistency_actions: Vec<String>,
    pub evidence_report: Option<EvidenceReport>,

    pub telemetry: Telemetry,
    pub mutations_applied: Option<MutationSummary>,
    pub memory_committed: bool,
}

impl StorytellerState {
    pub fn payload(&self) -> NarrationPayload {
        NarrationPayload {
            entities_mentioned: self.entities_mentioned.clone(),
            key_events: self.key_events.clone(),
            character_updates: self.character_updates.clone(),
            new_items: self.new_items.clone(),
            step_start_chapter_idx: None,
            step_end_chapter_idx: None,
        }
    }

    pub fn memories(&self) -> &[MemoryHit] {
        self.awakened_memories.as_deref().unwrap_or(&[])
    }
}

/// Coarse token estimate for CJK-heavy text (~2 chars/token). Never
/// part of any cache key.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    ((text.chars().count() as u64) / 2).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_event_where_field_round_trips() {
        let event: KeyEvent =
            serde_json::from_str(r#"{"who":"韩立","what":"斩杀妖兽","where":"秘境"}"#).unwrap();
        assert_eq!(event.where_, "秘境");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"where\":\"秘境\""));
    }

    #[test]
    fn token_estimate_is_half_chars() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("四个汉字"), 2);
    }
}
