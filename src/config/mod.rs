//! Layered configuration.
//!
//! Merge order: built-in defaults < profile YAML < custom YAML <
//! programmatic overrides < environment. Validation happens once, at
//! load time; everything downstream trusts the tree.

pub mod loader;
pub mod schema;

pub use loader::{load_config, masked_env_snapshot, LoadOptions};
pub use schema::{
    AppConfig, CacheSection, ChatEndpoint, EmbeddingEndpoint, EntityExtractMode, IngestSection,
    LlmProvider, LlmSection, ObservabilitySection, ProviderKind, SplitSection, StepAlign,
    StepMemoryMode, StepResumeMode, StorageSection, StorytellerSection, SummarizeSection, Tier,
    TierProfile, TieringSection,
};

/// Configuration failures are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("unknown route target: {0}")]
    UnknownRoute(String),

    #[error("missing required API key env for route '{route}': {env}")]
    MissingApiKey { route: String, env: String },

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("config did not match schema: {0}")]
    Schema(#[from] serde_json::Error),
}
