//! # storyweaver
//!
//! Turns a book-length text into a chapter-by-chapter "storyteller"
//! rewrite through a resumable, cache-coherent, content-addressed
//! pipeline: ingest and chunk the source, then per chapter (or per
//! step-aligned batch) extract entities, retrieve prior context via
//! hybrid dense+keyword search, generate a narration against the
//! evolving world-state, verify the claims against evidence, and
//! commit into persistent world-state tables with snapshot
//! checkpoints that allow exact resume and restore.
//!
//! Subsystem map:
//!
//! - [`hashing`] — SHA-256 identity for every unit of work
//! - [`config`] — layered configuration
//! - [`storage`] — relational store, FTS indexes, world-state tables
//! - [`vector`] — append-only per-book embedding tables
//! - [`cache`] — content-addressed LLM response cache
//! - [`llm`] — routes, retrying chat client, embeddings
//! - [`ingest`] — decode, normalize, chapterize, chunk
//! - [`retrieval`] — hybrid memory retrieval and asset builds
//! - [`storyteller`] — the chapter DAG and the step executor
//! - [`summarize`] — legacy v1 map-reduce summaries
//! - [`export`] — markdown bundles

pub mod cache;
pub mod config;
pub mod export;
pub mod hashing;
pub mod ingest;
pub mod llm;
pub mod retrieval;
pub mod storage;
pub mod storyteller;
pub mod summarize;
pub mod vector;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
