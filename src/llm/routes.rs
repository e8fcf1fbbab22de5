//! Route resolution: a logical route name becomes a concrete
//! `(endpoint, provider)` pair plus the secrets it needs. A route
//! whose provider names an API key env that is unset is a fatal
//! configuration error.

use crate::config::schema::ChatRoute;
use crate::config::{AppConfig, ConfigError, ProviderKind};

#[derive(Debug, Clone)]
pub struct ResolvedChatRuntime {
    pub route: ChatRoute,
    pub endpoint_name: String,
    pub provider_name: String,
    pub provider_kind: ProviderKind,
    pub model: String,
    pub temperature: f64,
    pub timeout_s: u64,
    pub max_concurrency: usize,
    pub retries: u32,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub api_key: Option<String>,
}

impl ResolvedChatRuntime {
    /// Stable model identity used in narration rows and cache keys.
    pub fn model_identifier(&self) -> String {
        format!("{}/{}/{}", self.provider_name, self.endpoint_name, self.model)
    }
}

pub fn resolve_chat_runtime(
    config: &AppConfig,
    route: ChatRoute,
) -> Result<ResolvedChatRuntime, ConfigError> {
    let (endpoint_name, endpoint, provider) = config.llm.resolve_chat_route(route)?;
    let api_key = match &provider.api_key_env {
        Some(env) => {
            let value = std::env::var(env).ok().filter(|v| !v.is_empty());
            if value.is_none() {
                return Err(ConfigError::MissingApiKey {
                    route: route.as_str().to_string(),
                    env: env.clone(),
                });
            }
            value
        }
        None => None,
    };

    Ok(ResolvedChatRuntime {
        route,
        endpoint_name,
        provider_name: endpoint.provider.clone(),
        provider_kind: provider.kind,
        model: endpoint.model.clone(),
        temperature: endpoint.temperature,
        timeout_s: endpoint.timeout_s,
        max_concurrency: endpoint.max_concurrency,
        retries: endpoint.retries,
        base_url: provider.base_url.clone(),
        api_key_env: provider.api_key_env.clone(),
        api_key,
    })
}

#[derive(Debug, Clone)]
pub struct ResolvedEmbeddingRuntime {
    pub endpoint_name: String,
    pub provider_name: String,
    pub provider_kind: ProviderKind,
    pub model: String,
    pub timeout_s: u64,
    pub max_concurrency: usize,
    pub retries: u32,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub api_key: Option<String>,
}

impl ResolvedEmbeddingRuntime {
    pub fn model_identifier(&self) -> String {
        format!("{}/{}/{}", self.provider_name, self.endpoint_name, self.model)
    }
}

pub fn resolve_embedding_runtime(
    config: &AppConfig,
) -> Result<ResolvedEmbeddingRuntime, ConfigError> {
    let (endpoint_name, endpoint, provider) = config.llm.resolve_embedding_route()?;
    let api_key = match &provider.api_key_env {
        Some(env) => {
            let value = std::env::var(env).ok().filter(|v| !v.is_empty());
            if value.is_none() {
                return Err(ConfigError::MissingApiKey {
                    route: "embedding".to_string(),
                    env: env.clone(),
                });
            }
            value
        }
        None => None,
    };

    Ok(ResolvedEmbeddingRuntime {
        endpoint_name,
        provider_name: endpoint.provider.clone(),
        provider_kind: provider.kind,
        model: endpoint.model.clone(),
        timeout_s: endpoint.timeout_s,
        max_concurrency: endpoint.max_concurrency,
        retries: endpoint.retries,
        base_url: provider.base_url.clone(),
        api_key_env: provider.api_key_env.clone(),
        api_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn missing_api_key_env_is_fatal() {
        let mut config = AppConfig::default();
        if let Some(provider) = config.llm.providers.get_mut("default") {
            provider.api_key_env = Some("STORYWEAVER_TEST_ABSENT_KEY".to_string());
        }
        let err = resolve_chat_runtime(&config, ChatRoute::StorytellerNarration).unwrap_err();
        assert!(matches!(err, ConfigError::MissingApiKey { .. }));
    }

    #[test]
    fn keyless_provider_resolves() {
        let mut config = AppConfig::default();
        if let Some(provider) = config.llm.providers.get_mut("default") {
            provider.api_key_env = None;
            provider.base_url = Some("http://127.0.0.1:8000/v1".to_string());
        }
        let runtime = resolve_chat_runtime(&config, ChatRoute::Storyteller).unwrap();
        assert_eq!(runtime.endpoint_name, "storyteller_default");
        assert_eq!(
            runtime.model_identifier(),
            "default/storyteller_default/gpt-4.1-mini"
        );
        assert!(runtime.api_key.is_none());
    }
}
