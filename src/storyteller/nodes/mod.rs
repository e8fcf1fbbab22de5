//! The storyteller DAG nodes.
//!
//! I/O nodes (`entity_extract`, `state_lookup`, `memory_retrieve`,
//! `storyteller_generate`, `refine_narration`, `state_update`) are
//! async and may fall back to deterministic branches when an LLM is
//! absent; that is not an error. `consistency_check` and
//! `evidence_verify` are pure and synchronous: they filter, never
//! raise on bad content.

pub mod consistency;
pub mod entity_extract;
pub mod evidence;
pub mod generate;
pub mod generate_step;
pub mod memory_commit;
pub mod memory_retrieve;
pub mod refine;
pub mod state_lookup;
pub mod state_update;
