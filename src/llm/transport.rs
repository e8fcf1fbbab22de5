//! Chat transport seam.
//!
//! A transport performs exactly one network attempt — retry policy
//! lives in [`crate::llm::client::LlmClient`] so the total attempt
//! count stays bounded at `retries + 1`. Tests swap in scripted
//! transports.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::routes::ResolvedChatRuntime;
use super::LlmError;

/// How the model is asked to shape its output.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseFormat {
    Text,
    JsonObject,
    JsonSchema {
        name: String,
        schema: Value,
        strict: bool,
    },
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub response_format: ResponseFormat,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// One attempt. `UnsupportedResponseFormat` signals the caller to
    /// fall down the structured-output ladder; any other error counts
    /// against the retry budget.
    async fn chat(&self, request: &ChatRequest) -> Result<String, LlmError>;
}

/// OpenAI-compatible `/chat/completions` transport.
pub struct HttpChatTransport {
    http: reqwest::Client,
    url: String,
    model: String,
    temperature: f64,
    api_key: Option<String>,
    timeout_s: u64,
}

impl HttpChatTransport {
    pub fn new(runtime: &ResolvedChatRuntime) -> Result<Self, LlmError> {
        let base = runtime
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(runtime.timeout_s))
            .build()
            .map_err(|err| LlmError::Transport(err.to_string()))?;
        Ok(Self {
            http,
            url: format!("{}/chat/completions", base.trim_end_matches('/')),
            model: runtime.model.clone(),
            temperature: runtime.temperature,
            api_key: runtime.api_key.clone(),
            timeout_s: runtime.timeout_s,
        })
    }

    fn body(&self, request: &ChatRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user},
            ],
        });
        match &request.response_format {
            ResponseFormat::Text => {}
            ResponseFormat::JsonObject => {
                body["response_format"] = json!({"type": "json_object"});
            }
            ResponseFormat::JsonSchema {
                name,
                schema,
                strict,
            } => {
                body["response_format"] = json!({
                    "type": "json_schema",
                    "json_schema": {"name": name, "schema": schema, "strict": strict},
                });
            }
        }
        body
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn chat(&self, request: &ChatRequest) -> Result<String, LlmError> {
        let mut builder = self.http.post(&self.url).json(&self.body(request));
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                LlmError::Timeout(self.timeout_s)
            } else {
                LlmError::Transport(err.to_string())
            }
        })?;

        let status = response.status();
        let payload = response
            .text()
            .await
            .map_err(|err| LlmError::Transport(err.to_string()))?;

        if !status.is_success() {
            // Providers that don't implement a response_format reject
            // the request with a 400 naming the field.
            if status.as_u16() == 400
                && payload.contains("response_format")
                && request.response_format != ResponseFormat::Text
            {
                return Err(LlmError::UnsupportedResponseFormat(format!(
                    "status={status} body_len={}",
                    payload.len()
                )));
            }
            let body_head: String = payload.chars().take(400).collect();
            return Err(LlmError::Transport(format!(
                "status={status} body={body_head}"
            )));
        }

        let value: Value = serde_json::from_str(&payload)
            .map_err(|err| LlmError::Transport(format!("malformed completion payload: {err}")))?;
        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .trim()
            .to_string();
        if content.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(content)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transports for unit tests.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Replays a fixed sequence of results, one per attempt.
    pub struct ScriptedTransport {
        responses: parking_lot::Mutex<Vec<Result<String, LlmError>>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedTransport {
        pub fn new(responses: Vec<Result<String, LlmError>>) -> Self {
            let mut reversed = responses;
            reversed.reverse();
            Self {
                responses: parking_lot::Mutex::new(reversed),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn chat(&self, _request: &ChatRequest) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .pop()
                .unwrap_or(Err(LlmError::EmptyResponse))
        }
    }

    /// Rejects schema formats, forcing the ladder down to json_object.
    pub struct NoSchemaTransport {
        pub inner: ScriptedTransport,
    }

    #[async_trait]
    impl ChatTransport for NoSchemaTransport {
        async fn chat(&self, request: &ChatRequest) -> Result<String, LlmError> {
            if matches!(request.response_format, ResponseFormat::JsonSchema { .. }) {
                return Err(LlmError::UnsupportedResponseFormat("schema".into()));
            }
            self.inner.chat(request).await
        }
    }
}
