//! Embedding clients.
//!
//! Two provider kinds: OpenAI-compatible `/embeddings` and Ollama's
//! `/api/embed`. Both retry with a short backoff
//! (`min(0.3·2^n, 2s)`). The trait seam lets retrieval tests use a
//! deterministic embedder.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::{AppConfig, ConfigError, ProviderKind};

use super::routes::{resolve_embedding_runtime, ResolvedEmbeddingRuntime};
use super::LlmError;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError>;

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let mut vectors = self.embed_documents(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| LlmError::Transport("embedding response is empty".into()))
    }

    fn model_identifier(&self) -> String;
}

pub struct HttpEmbeddingClient {
    runtime: ResolvedEmbeddingRuntime,
    http: reqwest::Client,
    url: String,
}

impl HttpEmbeddingClient {
    pub fn new(config: &AppConfig) -> Result<Self, ConfigError> {
        let runtime = resolve_embedding_runtime(config)?;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(runtime.timeout_s))
            .build()
            .map_err(|err| ConfigError::Invalid(format!("embedding transport init: {err}")))?;
        let url = match runtime.provider_kind {
            ProviderKind::Ollama => {
                let base = runtime
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "http://127.0.0.1:11434".to_string());
                let base = base.trim_end_matches('/');
                if base.ends_with("/api") {
                    format!("{base}/embed")
                } else {
                    format!("{base}/api/embed")
                }
            }
            ProviderKind::OpenaiCompatible => {
                let base = runtime
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
                format!("{}/embeddings", base.trim_end_matches('/'))
            }
        };
        Ok(Self { runtime, http, url })
    }

    async fn request_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let body = json!({"model": self.runtime.model, "input": texts});
        let mut builder = self.http.post(&self.url).json(&body);
        if let Some(api_key) = &self.runtime.api_key {
            builder = builder.bearer_auth(api_key);
        }
        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                LlmError::Timeout(self.runtime.timeout_s)
            } else {
                LlmError::Transport(err.to_string())
            }
        })?;
        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|err| LlmError::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(LlmError::Transport(format!(
                "embedding request failed status={status}"
            )));
        }
        extract_embeddings(&payload, self.runtime.provider_kind)
    }
}

/// Pull vectors out of either provider's response shape.
fn extract_embeddings(payload: &Value, kind: ProviderKind) -> Result<Vec<Vec<f32>>, LlmError> {
    let to_vec = |value: &Value| -> Option<Vec<f32>> {
        value
            .as_array()?
            .iter()
            .map(|n| n.as_f64().map(|f| f as f32))
            .collect()
    };

    match kind {
        ProviderKind::OpenaiCompatible => {
            let data = payload["data"].as_array().ok_or_else(|| {
                LlmError::Transport("embedding response missing 'data'".into())
            })?;
            data.iter()
                .map(|item| {
                    to_vec(&item["embedding"]).ok_or_else(|| {
                        LlmError::Transport("embedding response row malformed".into())
                    })
                })
                .collect()
        }
        ProviderKind::Ollama => {
            if let Some(rows) = payload["embeddings"].as_array() {
                // A flat numeric list means a single vector.
                if rows.first().map(Value::is_number).unwrap_or(false) {
                    let vector = to_vec(&payload["embeddings"]).ok_or_else(|| {
                        LlmError::Transport("ollama embedding malformed".into())
                    })?;
                    return Ok(vec![vector]);
                }
                return rows
                    .iter()
                    .map(|row| {
                        to_vec(row).ok_or_else(|| {
                            LlmError::Transport("ollama embedding row malformed".into())
                        })
                    })
                    .collect();
            }
            if payload["embedding"].is_array() {
                let vector = to_vec(&payload["embedding"]).ok_or_else(|| {
                    LlmError::Transport("ollama embedding malformed".into())
                })?;
                return Ok(vec![vector]);
            }
            Err(LlmError::Transport(
                "invalid ollama embedding response: missing 'embeddings' or 'embedding'".into(),
            ))
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingClient {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let attempts = self.runtime.retries.saturating_add(1).max(1);
        let mut last = None;
        for attempt in 0..attempts {
            match self.request_once(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(err) => {
                    log::warn!(
                        "Embedding call failed endpoint={} model={} attempt={}/{} error={}",
                        self.runtime.endpoint_name,
                        self.runtime.model,
                        attempt + 1,
                        attempts,
                        err
                    );
                    last = Some(err);
                    if attempt + 1 < attempts {
                        let backoff = (0.3_f64 * 2_f64.powi(attempt as i32)).min(2.0);
                        tokio::time::sleep(std::time::Duration::from_secs_f64(backoff)).await;
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| LlmError::Transport("embedding request failed".into())))
    }

    fn model_identifier(&self) -> String {
        self.runtime.model_identifier()
    }
}
