//! LLM access: route resolution, the retrying chat client, the
//! embedding clients, and lenient JSON recovery.

pub mod client;
pub mod embeddings;
pub mod json_utils;
pub mod routes;
pub mod transport;

pub use client::{LlmClient, LlmResponse, LogContext, StructuredSpec};
pub use embeddings::{EmbeddingProvider, HttpEmbeddingClient};
pub use routes::{resolve_chat_runtime, resolve_embedding_runtime, ResolvedChatRuntime};
pub use transport::{ChatRequest, ChatTransport, HttpChatTransport, ResponseFormat};

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("LLM call timed out after {0}s")]
    Timeout(u64),

    #[error("empty LLM response")]
    EmptyResponse,

    #[error("response format not supported: {0}")]
    UnsupportedResponseFormat(String),

    #[error("response parse failed: {0}")]
    Parse(String),

    #[error("LLM call failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}
