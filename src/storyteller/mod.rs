//! The storyteller pipeline: per-chapter DAG, step executor, tiering,
//! prompts, and the shared state record.

pub mod graph;
pub mod nodes;
pub mod prompts;
pub mod service;
pub mod state;
pub mod step;
pub mod step_service;
pub mod tiering;

pub use graph::{GraphContext, GraphError, NarrationMeta, StorytellerGraph};
pub use service::{storytell_book, StorytellStats, StorytellerRuntime, STORYTELLER_FALLBACK_MODEL};
pub use state::{
    CharacterUpdate, EvidenceReport, KeyEvent, MutationSummary, NarrationPayload, NewItem,
    StorytellerState, Telemetry,
};
pub use step_service::{storytell_book_steps, StepStats};
pub use tiering::{build_tier_overrides, decide_tier, has_storyteller_memory_retrieval};
