//! Plain row types returned by the store.
//!
//! World-state rows derive serde because checkpoint snapshots persist
//! them verbatim (ids included) and prompts embed them as JSON.

use serde::{Deserialize, Serialize};

/// Outcome of an upsert: the row id and whether a new row was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertResult {
    pub id: i64,
    pub inserted: bool,
}

#[derive(Debug, Clone)]
pub struct BookRow {
    pub id: i64,
    pub title: Option<String>,
    pub author: Option<String>,
    pub book_hash: String,
    pub source_path: String,
}

#[derive(Debug, Clone)]
pub struct ChapterRow {
    pub id: i64,
    pub book_id: i64,
    pub idx: i64,
    pub title: String,
    pub chapter_hash: String,
    pub start_pos: i64,
    pub end_pos: i64,
}

#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub id: i64,
    pub idx: i64,
    pub text: String,
    pub chunk_hash: String,
    pub token_count: i64,
}

#[derive(Debug, Clone)]
pub struct NarrationRow {
    pub id: i64,
    pub book_id: i64,
    pub chapter_id: i64,
    pub chapter_idx: i64,
    pub narration_text: String,
    pub key_events_json: Option<String>,
    pub prompt_version: String,
    pub model: String,
    pub input_hash: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NarrationOutputRow {
    pub id: i64,
    pub narration_id: i64,
    pub book_id: i64,
    pub chapter_id: i64,
    pub chapter_idx: i64,
    pub prompt_version: String,
    pub model: String,
    pub input_hash: String,
    pub payload_json: String,
}

#[derive(Debug, Clone)]
pub struct SummaryRow {
    pub id: i64,
    pub scope: String,
    pub ref_id: i64,
    pub summary_type: String,
    pub prompt_version: String,
    pub model: String,
    pub input_hash: String,
    pub content: String,
    pub params_json: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterRow {
    pub id: i64,
    pub book_id: i64,
    pub canonical_name: String,
    pub aliases_json: String,
    pub first_chapter_idx: Option<i64>,
    pub last_chapter_idx: Option<i64>,
    pub status: String,
    pub location: Option<String>,
    pub abilities_json: Option<String>,
    pub relationships_json: Option<String>,
    pub motivation: Option<String>,
    pub notes: Option<String>,
}

impl CharacterRow {
    /// Aliases decoded from the stored JSON array; bad payloads read
    /// as empty.
    pub fn aliases(&self) -> Vec<String> {
        serde_json::from_str(&self.aliases_json).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRow {
    pub id: i64,
    pub book_id: i64,
    pub name: String,
    pub owner_name: Option<String>,
    pub first_chapter_idx: Option<i64>,
    pub last_chapter_idx: Option<i64>,
    pub description: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotEventRow {
    pub id: i64,
    pub book_id: i64,
    pub chapter_idx: i64,
    pub event_summary: String,
    pub involved_characters_json: Option<String>,
    pub event_type: Option<String>,
    pub impact: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldFactRow {
    pub id: i64,
    pub book_id: i64,
    pub fact_key: String,
    pub fact_value: String,
    pub confidence: f64,
    pub source_chapter_idx: Option<i64>,
    pub source_excerpt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WorldStateCheckpointRow {
    pub id: i64,
    pub book_id: i64,
    pub chapter_idx: i64,
    pub step_size: i64,
    pub snapshot_json: String,
    pub snapshot_hash: String,
}

/// One FTS hit over chunks or narrations.
#[derive(Debug, Clone)]
pub struct SearchHitRow {
    pub source_type: &'static str,
    pub source_id: i64,
    pub chapter_idx: i64,
    pub chapter_title: String,
    pub text: String,
    pub score: Option<f64>,
}
