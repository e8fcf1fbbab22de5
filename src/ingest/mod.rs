//! Source ingestion: decode, normalize, chapterize, chunk, persist.

pub mod parser;
pub mod service;
pub mod splitter;

pub use parser::{load_text_auto, normalize_text, parse_chapters, ParsedChapter, TextLoadResult};
pub use service::{ingest_book, IngestStats};
pub use splitter::{split_text, TextChunk};

use crate::storage::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("failed to read {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("text is empty after normalization: {path}")]
    EmptyText { path: String },

    #[error("invalid chapter regex '{pattern}': {source}")]
    BadRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
