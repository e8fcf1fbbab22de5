//! The retrying, cached, concurrency-bounded chat client.
//!
//! Each call path is: cache probe → bounded attempts against the
//! transport with exponential backoff (`min(0.5·2^n, 4s)`) → cache
//! write. Cached payloads that no longer parse are logged with
//! `source=cache` and deleted so they are never served twice. Every
//! parse failure logs route/provider/endpoint/model plus short cache
//! key and input hash, the attempt counter, the error location, and
//! the raw payload's length and hash.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::cache::LlmCache;
use crate::config::schema::ChatRoute;
use crate::config::{AppConfig, ConfigError, ObservabilitySection};
use crate::hashing::{sha256_text, short_hash};

use super::json_utils::{self, JsonRecoveryError};
use super::routes::{resolve_chat_runtime, ResolvedChatRuntime};
use super::transport::{ChatRequest, ChatTransport, HttpChatTransport, ResponseFormat};
use super::LlmError;

/// A completed call: the raw text and whether it came from the cache.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub cached: bool,
}

/// JSON schema attached to a structured call.
#[derive(Debug, Clone)]
pub struct StructuredSpec {
    pub name: &'static str,
    pub schema: Value,
}

/// Caller-provided correlation fields for log lines.
#[derive(Debug, Clone, Default)]
pub struct LogContext {
    pub node: Option<String>,
    pub chapter_id: Option<i64>,
    pub chapter_idx: Option<String>,
    pub input_hash: Option<String>,
}

impl LogContext {
    pub fn for_node(node: &str, chapter_id: i64, chapter_idx: i64) -> Self {
        Self {
            node: Some(node.to_string()),
            chapter_id: Some(chapter_id),
            chapter_idx: Some(chapter_idx.to_string()),
            input_hash: None,
        }
    }

    pub fn with_input_hash(mut self, input_hash: &str) -> Self {
        self.input_hash = Some(input_hash.to_string());
        self
    }
}

pub struct LlmClient {
    runtime: ResolvedChatRuntime,
    pub model_identifier: String,
    transport: Arc<dyn ChatTransport>,
    cache: Arc<LlmCache>,
    semaphore: Semaphore,
    observability: ObservabilitySection,
    /// First structured-output format the transport accepted; probes
    /// resume from here on later calls.
    structured_format_hint: AtomicUsize,
}

impl LlmClient {
    pub fn new(
        config: &AppConfig,
        cache: Arc<LlmCache>,
        route: ChatRoute,
    ) -> Result<Self, ConfigError> {
        let runtime = resolve_chat_runtime(config, route)?;
        let transport = HttpChatTransport::new(&runtime)
            .map_err(|err| ConfigError::Invalid(format!("chat transport init failed: {err}")))?;
        Ok(Self::with_transport(
            runtime,
            cache,
            config.observability.clone(),
            Arc::new(transport),
        ))
    }

    pub fn with_transport(
        runtime: ResolvedChatRuntime,
        cache: Arc<LlmCache>,
        observability: ObservabilitySection,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        let model_identifier = runtime.model_identifier();
        let permits = runtime.max_concurrency.max(1);
        Self {
            runtime,
            model_identifier,
            transport,
            cache,
            semaphore: Semaphore::new(permits),
            observability,
            structured_format_hint: AtomicUsize::new(0),
        }
    }

    pub fn temperature(&self) -> f64 {
        self.runtime.temperature
    }

    /// Plain text completion.
    pub async fn complete(
        &self,
        system: &str,
        user: &str,
        cache_key: &str,
        ctx: &LogContext,
    ) -> Result<LlmResponse, LlmError> {
        if let Some(value) = self.cache.get(cache_key).value {
            return Ok(LlmResponse {
                text: value,
                cached: true,
            });
        }
        let request = ChatRequest {
            system: system.to_string(),
            user: user.to_string(),
            response_format: ResponseFormat::Text,
        };
        let (text, ()) = self
            .invoke_with_retry(&request, cache_key, ctx, |_| Ok(()))
            .await?;
        self.cache.set(cache_key, &text);
        Ok(LlmResponse {
            text,
            cached: false,
        })
    }

    /// JSON-object completion with lenient recovery into `T`.
    pub async fn complete_json<T: DeserializeOwned>(
        &self,
        system: &str,
        user: &str,
        cache_key: &str,
        ctx: &LogContext,
    ) -> Result<(LlmResponse, T), LlmError> {
        if let Some(cached) = self.cache.get(cache_key).value {
            match json_utils::parse_object_as::<T>(&cached) {
                Ok(parsed) => {
                    return Ok((
                        LlmResponse {
                            text: cached,
                            cached: true,
                        },
                        parsed,
                    ))
                }
                Err(err) => {
                    self.log_parse_failure("cache", &cached, &err, cache_key, None, ctx);
                    log::warn!(
                        "Deleting invalid cached LLM response {}",
                        self.log_prefix(cache_key, ctx)
                    );
                    self.cache.delete(cache_key);
                }
            }
        }

        let request = ChatRequest {
            system: system.to_string(),
            user: user.to_string(),
            response_format: ResponseFormat::JsonObject,
        };
        let (text, parsed) = self
            .invoke_with_retry(&request, cache_key, ctx, json_utils::parse_object_as::<T>)
            .await?;
        self.cache.set(cache_key, &text);
        Ok((
            LlmResponse {
                text,
                cached: false,
            },
            parsed,
        ))
    }

    /// Structured completion. Formats are tried in order
    /// `{schema strict, schema, json_object, text}`; the first one
    /// the transport accepts is memoized for later calls. Ladder
    /// descent does not consume retry attempts.
    pub async fn complete_structured<T: DeserializeOwned>(
        &self,
        system: &str,
        user: &str,
        cache_key: &str,
        spec: &StructuredSpec,
        ctx: &LogContext,
    ) -> Result<(LlmResponse, T), LlmError> {
        if let Some(cached) = self.cache.get(cache_key).value {
            match json_utils::parse_object_as::<T>(&cached) {
                Ok(parsed) => {
                    return Ok((
                        LlmResponse {
                            text: cached,
                            cached: true,
                        },
                        parsed,
                    ))
                }
                Err(err) => {
                    self.log_parse_failure("cache_structured", &cached, &err, cache_key, None, ctx);
                    log::warn!(
                        "Deleting invalid cached structured response {}",
                        self.log_prefix(cache_key, ctx)
                    );
                    self.cache.delete(cache_key);
                }
            }
        }

        let formats = [
            ResponseFormat::JsonSchema {
                name: spec.name.to_string(),
                schema: spec.schema.clone(),
                strict: true,
            },
            ResponseFormat::JsonSchema {
                name: spec.name.to_string(),
                schema: spec.schema.clone(),
                strict: false,
            },
            ResponseFormat::JsonObject,
            ResponseFormat::Text,
        ];
        let mut format_idx = self
            .structured_format_hint
            .load(Ordering::Relaxed)
            .min(formats.len() - 1);

        loop {
            let request = ChatRequest {
                system: system.to_string(),
                user: user.to_string(),
                response_format: formats[format_idx].clone(),
            };
            match self
                .invoke_with_retry(&request, cache_key, ctx, json_utils::parse_object_as::<T>)
                .await
            {
                Ok((text, parsed)) => {
                    self.structured_format_hint
                        .store(format_idx, Ordering::Relaxed);
                    self.cache.set(cache_key, &text);
                    return Ok((
                        LlmResponse {
                            text,
                            cached: false,
                        },
                        parsed,
                    ));
                }
                Err(LlmError::UnsupportedResponseFormat(detail))
                    if format_idx + 1 < formats.len() =>
                {
                    log::warn!(
                        "Structured output format rejected, falling back {} detail={detail}",
                        self.log_prefix(cache_key, ctx)
                    );
                    format_idx += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Bounded attempts: `retries + 1` transport calls, each under
    /// the endpoint semaphore, backing off `min(0.5·2^n, 4s)`.
    async fn invoke_with_retry<T>(
        &self,
        request: &ChatRequest,
        cache_key: &str,
        ctx: &LogContext,
        parse: impl Fn(&str) -> Result<T, JsonRecoveryError>,
    ) -> Result<(String, T), LlmError> {
        let attempts = self.runtime.retries.saturating_add(1).max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            let started = std::time::Instant::now();
            let outcome = {
                let _permit = self
                    .semaphore
                    .acquire()
                    .await
                    .map_err(|_| LlmError::Transport("semaphore closed".into()))?;
                self.transport.chat(request).await
            };

            let error: LlmError = match outcome {
                Ok(text) => match parse(&text) {
                    Ok(parsed) => return Ok((text, parsed)),
                    Err(parse_err) => {
                        self.log_parse_failure(
                            "llm_response",
                            &text,
                            &parse_err,
                            cache_key,
                            Some((attempt + 1, attempts)),
                            ctx,
                        );
                        LlmError::Parse(parse_err.to_string())
                    }
                },
                // The structured ladder reacts to this without
                // consuming the attempt budget.
                Err(LlmError::UnsupportedResponseFormat(detail)) => {
                    return Err(LlmError::UnsupportedResponseFormat(detail))
                }
                Err(err) => err,
            };

            last_error = error.to_string();
            let elapsed_ms = started.elapsed().as_millis();
            if self.observability.log_retry_attempts {
                log::warn!(
                    "LLM call failed {} attempt={}/{} elapsed_ms={} error_type={} error={}",
                    self.log_prefix(cache_key, ctx),
                    attempt + 1,
                    attempts,
                    elapsed_ms,
                    error_type(&error),
                    error,
                );
            }
            if attempt + 1 == attempts {
                log::error!(
                    "LLM call failed on final attempt {} attempts={}",
                    self.log_prefix(cache_key, ctx),
                    attempts
                );
                break;
            }
            let backoff = (0.5_f64 * 2_f64.powi(attempt as i32)).min(4.0);
            tokio::time::sleep(std::time::Duration::from_secs_f64(backoff)).await;
        }

        Err(LlmError::RetriesExhausted {
            attempts,
            last: last_error,
        })
    }

    fn log_prefix(&self, cache_key: &str, ctx: &LogContext) -> String {
        let mut parts = vec![
            format!("route={}", self.runtime.route.as_str()),
            format!("provider={}", self.runtime.provider_name),
            format!("endpoint={}", self.runtime.endpoint_name),
            format!("model={}", self.runtime.model),
            format!("cache_key={}", short_hash(cache_key)),
        ];
        if let Some(node) = &ctx.node {
            parts.push(format!("node={node}"));
        }
        if let Some(chapter_id) = ctx.chapter_id {
            parts.push(format!("chapter_id={chapter_id}"));
        }
        if let Some(chapter_idx) = &ctx.chapter_idx {
            parts.push(format!("chapter_idx={chapter_idx}"));
        }
        if let Some(input_hash) = &ctx.input_hash {
            parts.push(format!("input_hash={}", short_hash(input_hash)));
        }
        parts.join(" ")
    }

    fn log_parse_failure(
        &self,
        source: &str,
        raw_text: &str,
        err: &JsonRecoveryError,
        cache_key: &str,
        attempt: Option<(u32, u32)>,
        ctx: &LogContext,
    ) {
        let location = json_utils::error_location(err).unwrap_or_else(|| "-".to_string());
        let attempt_field = attempt
            .map(|(n, total)| format!(" attempt={n}/{total}"))
            .unwrap_or_default();
        log::warn!(
            "JSON parse failed {}{attempt_field} source={source} error_type={} error={} location={} raw_len={} raw_hash={}",
            self.log_prefix(cache_key, ctx),
            recovery_error_type(err),
            err,
            location,
            raw_text.len(),
            sha256_text(raw_text),
        );
        if self.observability.log_json_error_payload {
            log::warn!(
                "JSON parse raw_response={}",
                format_payload_for_log(raw_text, self.observability.json_error_payload_max_chars)
            );
        }
    }
}

fn error_type(err: &LlmError) -> &'static str {
    match err {
        LlmError::Transport(_) => "transport",
        LlmError::Timeout(_) => "timeout",
        LlmError::EmptyResponse => "empty_response",
        LlmError::UnsupportedResponseFormat(_) => "unsupported_response_format",
        LlmError::Parse(_) => "parse",
        LlmError::RetriesExhausted { .. } => "retries_exhausted",
        LlmError::Config(_) => "config",
    }
}

fn recovery_error_type(err: &JsonRecoveryError) -> &'static str {
    match err {
        JsonRecoveryError::Empty => "empty",
        JsonRecoveryError::NotObject => "not_object",
        JsonRecoveryError::NotArray => "not_array",
        JsonRecoveryError::Parse(_) => "json_decode",
    }
}

/// Head/tail truncation with an omitted-count marker. `max_chars = 0`
/// logs the whole payload.
fn format_payload_for_log(payload: &str, max_chars: usize) -> String {
    if max_chars == 0 || payload.len() <= max_chars {
        return payload.to_string();
    }
    let head_len = max_chars / 2;
    let tail_len = max_chars - head_len;
    if head_len == 0 || tail_len == 0 {
        return safe_prefix(payload, max_chars).to_string();
    }
    let head = safe_prefix(payload, head_len);
    let tail = safe_suffix(payload, tail_len);
    let omitted = payload.len().saturating_sub(head.len() + tail.len());
    format!("{head}\n...[truncated {omitted} chars]...\n{tail}")
}

fn safe_prefix(text: &str, mut at: usize) -> &str {
    while at > 0 && !text.is_char_boundary(at) {
        at -= 1;
    }
    &text[..at]
}

fn safe_suffix(text: &str, len: usize) -> &str {
    let mut at = text.len().saturating_sub(len);
    while at < text.len() && !text.is_char_boundary(at) {
        at += 1;
    }
    &text[at..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ChatRoute;
    use crate::config::ProviderKind;
    use crate::llm::transport::testing::{NoSchemaTransport, ScriptedTransport};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Payload {
        answer: String,
    }

    fn runtime(retries: u32) -> ResolvedChatRuntime {
        ResolvedChatRuntime {
            route: ChatRoute::StorytellerNarration,
            endpoint_name: "test".into(),
            provider_name: "default".into(),
            provider_kind: ProviderKind::OpenaiCompatible,
            model: "test-model".into(),
            temperature: 0.2,
            timeout_s: 5,
            max_concurrency: 2,
            retries,
            base_url: None,
            api_key_env: None,
            api_key: None,
        }
    }

    fn client(retries: u32, transport: Arc<dyn ChatTransport>) -> LlmClient {
        LlmClient::with_transport(
            runtime(retries),
            Arc::new(LlmCache::memory(3600)),
            ObservabilitySection::default(),
            transport,
        )
    }

    #[tokio::test]
    async fn complete_caches_responses() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok("hello".into())]));
        let client = client(0, transport.clone());
        let ctx = LogContext::default();

        let first = client.complete("s", "u", "key", &ctx).await.unwrap();
        assert!(!first.cached);
        let second = client.complete("s", "u", "key", &ctx).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.text, "hello");
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn retry_is_bounded_at_retries_plus_one() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(LlmError::Transport("boom-1".into())),
            Err(LlmError::Transport("boom-2".into())),
            Err(LlmError::Transport("boom-3".into())),
            Ok("never reached".into()),
        ]));
        let client = client(2, transport.clone());
        // Paused time auto-advances through the backoff sleeps.
        tokio::time::pause();
        let err = client
            .complete("s", "u", "key", &LogContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn corrupt_cache_entry_is_deleted_and_refetched() {
        let cache = Arc::new(LlmCache::memory(3600));
        cache.set("key", "not json at all");
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(
            "{\"answer\": \"fresh\"}".into()
        )]));
        let client = LlmClient::with_transport(
            runtime(0),
            cache.clone(),
            ObservabilitySection::default(),
            transport,
        );
        let (response, parsed): (LlmResponse, Payload) = client
            .complete_json("s", "u", "key", &LogContext::default())
            .await
            .unwrap();
        assert!(!response.cached);
        assert_eq!(parsed.answer, "fresh");
        // The corrupt value was replaced by the fresh one.
        assert_eq!(cache.get("key").value.as_deref(), Some("{\"answer\": \"fresh\"}"));
    }

    #[tokio::test]
    async fn structured_ladder_falls_back_to_json_object() {
        let transport = Arc::new(NoSchemaTransport {
            inner: ScriptedTransport::new(vec![Ok("{\"answer\": \"ok\"}".into())]),
        });
        let client = client(0, transport);
        let spec = StructuredSpec {
            name: "payload",
            schema: json!({"type": "object"}),
        };
        let (_, parsed): (_, Payload) = client
            .complete_structured("s", "u", "key", &spec, &LogContext::default())
            .await
            .unwrap();
        assert_eq!(parsed.answer, "ok");
        // The accepted rung is memoized.
        assert_eq!(client.structured_format_hint.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn payload_truncation_marks_omitted_chars() {
        let formatted = format_payload_for_log(&"x".repeat(100), 20);
        assert!(formatted.contains("...[truncated 80 chars]..."));
        assert_eq!(format_payload_for_log("short", 0), "short");
    }
}
