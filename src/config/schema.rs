//! Typed configuration tree.
//!
//! Mirrors the on-disk YAML layout section by section. Defaults are
//! chosen so an empty file is a working configuration (modulo API
//! keys). `AppConfig::validate` enforces the cross-field rules that
//! serde cannot express: route references, ratio ordering, ranges.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppSection {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub log_level: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            output_dir: PathBuf::from("./output"),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestCleanup {
    pub strip_blank_lines: bool,
    pub normalize_fullwidth: bool,
}

impl Default for IngestCleanup {
    fn default() -> Self {
        Self {
            strip_blank_lines: true,
            normalize_fullwidth: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestSection {
    /// Source encoding. `auto` scores a fixed candidate list.
    pub encoding: String,
    pub chapter_regex: Option<String>,
    /// Window size for the no-regex fallback chapterization.
    pub fallback_chapter_chars: usize,
    pub cleanup: IngestCleanup,
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            encoding: "auto".to_string(),
            chapter_regex: None,
            fallback_chapter_chars: 20_000,
            cleanup: IngestCleanup::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SplitSection {
    pub chunk_size_tokens: usize,
    pub chunk_overlap_tokens: usize,
    pub min_chunk_tokens: usize,
}

impl Default for SplitSection {
    fn default() -> Self {
        Self {
            chunk_size_tokens: 1200,
            chunk_overlap_tokens: 120,
            min_chunk_tokens: 200,
        }
    }
}

impl SplitSection {
    /// Stable identity string folded into every chunk hash.
    pub fn params_string(&self) -> String {
        format!(
            "size={};overlap={};min={}",
            self.chunk_size_tokens, self.chunk_overlap_tokens, self.min_chunk_tokens
        )
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size_tokens == 0 || self.chunk_overlap_tokens == 0 || self.min_chunk_tokens == 0 {
            return Err(ConfigError::Invalid(
                "split config values must be positive".into(),
            ));
        }
        if self.chunk_overlap_tokens >= self.chunk_size_tokens {
            return Err(ConfigError::Invalid(
                "chunk_overlap_tokens must be less than chunk_size_tokens".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenaiCompatible,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmProvider {
    pub kind: ProviderKind,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
}

impl Default for LlmProvider {
    fn default() -> Self {
        Self {
            kind: ProviderKind::OpenaiCompatible,
            base_url: None,
            api_key_env: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatEndpoint {
    pub provider: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmbeddingEndpoint {
    pub provider: String,
    pub model: String,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

fn default_temperature() -> f64 {
    0.3
}
fn default_timeout_s() -> u64 {
    60
}
fn default_max_concurrency() -> usize {
    6
}
fn default_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmRoutes {
    pub summarize_chat: Option<String>,
    pub storyteller_chat: String,
    pub storyteller_entity_chat: Option<String>,
    pub storyteller_narration_chat: Option<String>,
    pub storyteller_refine_chat: Option<String>,
    pub embedding: String,
}

impl Default for LlmRoutes {
    fn default() -> Self {
        Self {
            summarize_chat: None,
            storyteller_chat: "storyteller_default".to_string(),
            storyteller_entity_chat: None,
            storyteller_narration_chat: None,
            storyteller_refine_chat: None,
            embedding: "embedding_default".to_string(),
        }
    }
}

/// The five chat routes the pipeline can resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatRoute {
    Summarize,
    Storyteller,
    StorytellerEntity,
    StorytellerNarration,
    StorytellerRefine,
}

impl ChatRoute {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRoute::Summarize => "summarize",
            ChatRoute::Storyteller => "storyteller",
            ChatRoute::StorytellerEntity => "storyteller_entity",
            ChatRoute::StorytellerNarration => "storyteller_narration",
            ChatRoute::StorytellerRefine => "storyteller_refine",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LlmSection {
    pub providers: BTreeMap<String, LlmProvider>,
    pub chat_endpoints: BTreeMap<String, ChatEndpoint>,
    pub embedding_endpoints: BTreeMap<String, EmbeddingEndpoint>,
    pub routes: LlmRoutes,
}

impl Default for LlmSection {
    fn default() -> Self {
        let mut providers = BTreeMap::new();
        providers.insert(
            "default".to_string(),
            LlmProvider {
                kind: ProviderKind::OpenaiCompatible,
                base_url: None,
                api_key_env: Some("OPENAI_API_KEY".to_string()),
            },
        );

        let mut chat_endpoints = BTreeMap::new();
        chat_endpoints.insert(
            "storyteller_default".to_string(),
            ChatEndpoint {
                provider: "default".to_string(),
                model: "gpt-4.1-mini".to_string(),
                temperature: 0.45,
                timeout_s: 60,
                max_concurrency: 4,
                retries: 3,
            },
        );

        let mut embedding_endpoints = BTreeMap::new();
        embedding_endpoints.insert(
            "embedding_default".to_string(),
            EmbeddingEndpoint {
                provider: "default".to_string(),
                model: "text-embedding-3-large".to_string(),
                timeout_s: 60,
                max_concurrency: 6,
                retries: 3,
            },
        );

        Self {
            providers,
            chat_endpoints,
            embedding_endpoints,
            routes: LlmRoutes::default(),
        }
    }
}

impl LlmSection {
    /// Resolve a chat route to `(endpoint_name, endpoint, provider)`.
    ///
    /// Entity and narration fall back to the base storyteller
    /// endpoint; refine falls back to narration, then storyteller;
    /// summarize falls back to storyteller.
    pub fn resolve_chat_route(
        &self,
        route: ChatRoute,
    ) -> Result<(String, &ChatEndpoint, &LlmProvider), ConfigError> {
        let endpoint_name = match route {
            ChatRoute::Summarize => self
                .routes
                .summarize_chat
                .as_deref()
                .unwrap_or(&self.routes.storyteller_chat),
            ChatRoute::Storyteller => &self.routes.storyteller_chat,
            ChatRoute::StorytellerEntity => self
                .routes
                .storyteller_entity_chat
                .as_deref()
                .unwrap_or(&self.routes.storyteller_chat),
            ChatRoute::StorytellerNarration => self
                .routes
                .storyteller_narration_chat
                .as_deref()
                .unwrap_or(&self.routes.storyteller_chat),
            ChatRoute::StorytellerRefine => self
                .routes
                .storyteller_refine_chat
                .as_deref()
                .or(self.routes.storyteller_narration_chat.as_deref())
                .unwrap_or(&self.routes.storyteller_chat),
        };

        let endpoint = self
            .chat_endpoints
            .get(endpoint_name)
            .ok_or_else(|| ConfigError::UnknownRoute(endpoint_name.to_string()))?;
        let provider = self
            .providers
            .get(&endpoint.provider)
            .ok_or_else(|| ConfigError::UnknownRoute(endpoint.provider.clone()))?;
        Ok((endpoint_name.to_string(), endpoint, provider))
    }

    pub fn resolve_embedding_route(
        &self,
    ) -> Result<(String, &EmbeddingEndpoint, &LlmProvider), ConfigError> {
        let endpoint_name = &self.routes.embedding;
        let endpoint = self
            .embedding_endpoints
            .get(endpoint_name)
            .ok_or_else(|| ConfigError::UnknownRoute(endpoint_name.clone()))?;
        let provider = self
            .providers
            .get(&endpoint.provider)
            .ok_or_else(|| ConfigError::UnknownRoute(endpoint.provider.clone()))?;
        Ok((endpoint_name.clone(), endpoint, provider))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::Invalid("llm.providers cannot be empty".into()));
        }
        if self.chat_endpoints.is_empty() {
            return Err(ConfigError::Invalid(
                "llm.chat_endpoints cannot be empty".into(),
            ));
        }
        if self.embedding_endpoints.is_empty() {
            return Err(ConfigError::Invalid(
                "llm.embedding_endpoints cannot be empty".into(),
            ));
        }

        for (name, endpoint) in &self.chat_endpoints {
            if !self.providers.contains_key(&endpoint.provider) {
                return Err(ConfigError::Invalid(format!(
                    "chat endpoint '{name}' references unknown provider '{}'",
                    endpoint.provider
                )));
            }
            if !(0.0..=2.0).contains(&endpoint.temperature) {
                return Err(ConfigError::Invalid(format!(
                    "chat endpoint '{name}' temperature must be between 0 and 2"
                )));
            }
        }
        for (name, endpoint) in &self.embedding_endpoints {
            if !self.providers.contains_key(&endpoint.provider) {
                return Err(ConfigError::Invalid(format!(
                    "embedding endpoint '{name}' references unknown provider '{}'",
                    endpoint.provider
                )));
            }
        }

        let check = |label: &str, target: Option<&str>| -> Result<(), ConfigError> {
            if let Some(target) = target {
                if !self.chat_endpoints.contains_key(target) {
                    return Err(ConfigError::Invalid(format!(
                        "llm.routes.{label} not found: {target}"
                    )));
                }
            }
            Ok(())
        };
        check("summarize_chat", self.routes.summarize_chat.as_deref())?;
        check("storyteller_chat", Some(&self.routes.storyteller_chat))?;
        check(
            "storyteller_entity_chat",
            self.routes.storyteller_entity_chat.as_deref(),
        )?;
        check(
            "storyteller_narration_chat",
            self.routes.storyteller_narration_chat.as_deref(),
        )?;
        check(
            "storyteller_refine_chat",
            self.routes.storyteller_refine_chat.as_deref(),
        )?;
        if !self.embedding_endpoints.contains_key(&self.routes.embedding) {
            return Err(ConfigError::Invalid(format!(
                "llm.routes.embedding not found: {}",
                self.routes.embedding
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WithCitations {
    pub enabled: bool,
    pub top_k: usize,
}

impl Default for WithCitations {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SummarizeSection {
    pub language: String,
    pub style: String,
    pub chapter_summary_words: (u32, u32),
    pub book_summary_words: (u32, u32),
    pub include_quotes: bool,
    pub with_citations: WithCitations,
}

impl Default for SummarizeSection {
    fn default() -> Self {
        Self {
            language: "zh".to_string(),
            style: "清晰、克制、不剧透关键反转".to_string(),
            chapter_summary_words: (200, 500),
            book_summary_words: (800, 1500),
            include_quotes: false,
            with_citations: WithCitations::default(),
        }
    }
}

/// Chapter tier: controls narration ratio, memory depth, dialogue
/// inclusion, refine activation and entity-extraction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Short,
    #[default]
    Medium,
    Long,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Short => "short",
            Tier::Medium => "medium",
            Tier::Long => "long",
        }
    }

    /// Preset narration ratio for the tier.
    pub fn preset_ratio(&self) -> (f64, f64) {
        match self {
            Tier::Short => (0.2, 0.3),
            Tier::Medium => (0.4, 0.5),
            Tier::Long => (0.65, 0.8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntityExtractMode {
    #[default]
    Llm,
    Regex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TierProfile {
    pub narration_ratio: (f64, f64),
    pub memory_top_k: usize,
    pub include_key_dialogue: bool,
    pub include_inner_thoughts: bool,
    pub refine_enabled: bool,
    pub entity_extract_mode: EntityExtractMode,
}

impl Default for TierProfile {
    fn default() -> Self {
        Self {
            narration_ratio: Tier::Medium.preset_ratio(),
            memory_top_k: 8,
            include_key_dialogue: true,
            include_inner_thoughts: true,
            refine_enabled: true,
            entity_extract_mode: EntityExtractMode::Llm,
        }
    }
}

impl TierProfile {
    fn preset(tier: Tier) -> Self {
        match tier {
            Tier::Short => Self {
                narration_ratio: tier.preset_ratio(),
                memory_top_k: 4,
                include_key_dialogue: false,
                include_inner_thoughts: false,
                refine_enabled: false,
                entity_extract_mode: EntityExtractMode::Regex,
            },
            Tier::Medium => Self::default(),
            Tier::Long => Self {
                narration_ratio: tier.preset_ratio(),
                memory_top_k: 12,
                include_key_dialogue: true,
                include_inner_thoughts: true,
                refine_enabled: true,
                entity_extract_mode: EntityExtractMode::Llm,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TieringSection {
    pub enabled: bool,
    pub default_tier: Tier,
    /// Every Nth chapter is promoted to long. 0 disables the rule.
    pub long_every_n: u64,
    /// Chapters at or above this char count are promoted. 0 disables.
    pub long_min_chars: usize,
    pub long_keyword_triggers: Vec<String>,
    pub short: TierProfile,
    pub medium: TierProfile,
    pub long: TierProfile,
}

impl Default for TieringSection {
    fn default() -> Self {
        Self {
            enabled: false,
            default_tier: Tier::Medium,
            long_every_n: 0,
            long_min_chars: 0,
            long_keyword_triggers: Vec::new(),
            short: TierProfile::preset(Tier::Short),
            medium: TierProfile::preset(Tier::Medium),
            long: TierProfile::preset(Tier::Long),
        }
    }
}

impl TieringSection {
    pub fn profile(&self, tier: Tier) -> &TierProfile {
        match tier {
            Tier::Short => &self.short,
            Tier::Medium => &self.medium,
            Tier::Long => &self.long,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepAlign {
    #[default]
    Auto,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepResumeMode {
    #[default]
    Continue,
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepMemoryMode {
    #[default]
    PerChapter,
    PerStepShared,
    Off,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorytellerSection {
    pub language: String,
    pub style: String,
    pub narration_preset: Tier,
    /// Explicit override; when absent the preset's ratio applies.
    pub narration_ratio: Option<(f64, f64)>,
    pub narration_temperature: f64,
    pub entity_temperature: f64,
    pub refine_temperature: f64,
    pub memory_top_k: usize,
    pub recent_events_window: i64,
    pub include_key_dialogue: bool,
    pub include_inner_thoughts: bool,
    pub refine_enabled: bool,
    pub entity_extract_mode: EntityExtractMode,
    pub evidence_min_support_score: f64,
    pub evidence_max_snippets: usize,
    pub prefetch_window: usize,
    pub step_size: i64,
    pub step_align: StepAlign,
    pub step_checkpoint_enabled: bool,
    pub step_resume_mode: StepResumeMode,
    pub step_memory_mode: StepMemoryMode,
    pub tiering: TieringSection,
}

impl Default for StorytellerSection {
    fn default() -> Self {
        Self {
            language: "zh".to_string(),
            style: "说书人/评书艺人风格，沉浸感强，保留关键对白和心理博弈".to_string(),
            narration_preset: Tier::Medium,
            narration_ratio: None,
            narration_temperature: 0.45,
            entity_temperature: 0.1,
            refine_temperature: 0.35,
            memory_top_k: 8,
            recent_events_window: 5,
            include_key_dialogue: true,
            include_inner_thoughts: true,
            refine_enabled: true,
            entity_extract_mode: EntityExtractMode::Llm,
            evidence_min_support_score: 0.18,
            evidence_max_snippets: 3,
            prefetch_window: 0,
            step_size: 1,
            step_align: StepAlign::Auto,
            step_checkpoint_enabled: true,
            step_resume_mode: StepResumeMode::Continue,
            step_memory_mode: StepMemoryMode::PerChapter,
            tiering: TieringSection::default(),
        }
    }
}

impl StorytellerSection {
    /// Ratio in effect when tiering does not override it.
    pub fn effective_narration_ratio(&self) -> (f64, f64) {
        self.narration_ratio
            .unwrap_or_else(|| self.narration_preset.preset_ratio())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (label, value) in [
            ("narration_temperature", self.narration_temperature),
            ("entity_temperature", self.entity_temperature),
            ("refine_temperature", self.refine_temperature),
        ] {
            if !(0.0..=2.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "storyteller.{label} must be between 0 and 2"
                )));
            }
        }
        if self.memory_top_k == 0 || self.recent_events_window <= 0 {
            return Err(ConfigError::Invalid(
                "storyteller integer config values must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.evidence_min_support_score) {
            return Err(ConfigError::Invalid(
                "evidence_min_support_score must be between 0 and 1".into(),
            ));
        }
        if self.evidence_max_snippets == 0 {
            return Err(ConfigError::Invalid(
                "evidence_max_snippets must be positive".into(),
            ));
        }
        if self.step_size <= 0 {
            return Err(ConfigError::Invalid("step_size must be positive".into()));
        }
        if let Some((low, high)) = self.narration_ratio {
            if !(0.0 < low && low < 1.0 && 0.0 < high && high < 1.0) {
                return Err(ConfigError::Invalid(
                    "narration_ratio values must be in range (0, 1)".into(),
                ));
            }
            if low >= high {
                return Err(ConfigError::Invalid(
                    "narration_ratio low bound must be less than the high bound".into(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSection {
    pub sqlite_path: PathBuf,
    pub vector_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("./data/novel.db"),
            vector_dir: PathBuf::from("./data/vectors"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSection {
    pub enabled: bool,
    pub backend: String,
    pub ttl_seconds: i64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: "sqlite".to_string(),
            ttl_seconds: 2_592_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObservabilitySection {
    pub log_json_error_payload: bool,
    /// 0 means never truncate the logged payload.
    pub json_error_payload_max_chars: usize,
    pub log_retry_attempts: bool,
}

impl Default for ObservabilitySection {
    fn default() -> Self {
        Self {
            log_json_error_payload: true,
            json_error_payload_max_chars: 0,
            log_retry_attempts: true,
        }
    }
}

/// The root of the configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub app: AppSection,
    pub ingest: IngestSection,
    pub split: SplitSection,
    pub llm: LlmSection,
    pub summarize: SummarizeSection,
    pub storyteller: StorytellerSection,
    pub storage: StorageSection,
    pub cache: CacheSection,
    pub observability: ObservabilitySection,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.split.validate()?;
        self.llm.validate()?;
        self.storyteller.validate()?;
        Ok(())
    }

    /// Anchor every relative path below `base_dir`.
    pub fn resolve_paths(&mut self, base_dir: &Path) {
        fn anchor(base: &Path, value: &mut PathBuf) {
            if value.is_relative() {
                *value = base.join(&*value);
            }
        }
        anchor(base_dir, &mut self.app.data_dir);
        anchor(base_dir, &mut self.app.output_dir);
        anchor(base_dir, &mut self.storage.sqlite_path);
        anchor(base_dir, &mut self.storage.vector_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn route_fallback_chain() {
        let llm = LlmSection::default();
        let (name, _, _) = llm.resolve_chat_route(ChatRoute::StorytellerEntity).unwrap();
        assert_eq!(name, "storyteller_default");
        let (name, _, _) = llm.resolve_chat_route(ChatRoute::StorytellerRefine).unwrap();
        assert_eq!(name, "storyteller_default");
        let (name, _, _) = llm.resolve_chat_route(ChatRoute::Summarize).unwrap();
        assert_eq!(name, "storyteller_default");
    }

    #[test]
    fn refine_prefers_narration_route_when_set() {
        let mut llm = LlmSection::default();
        llm.chat_endpoints.insert(
            "narr".to_string(),
            ChatEndpoint {
                provider: "default".to_string(),
                model: "m".to_string(),
                temperature: 0.2,
                timeout_s: 30,
                max_concurrency: 2,
                retries: 1,
            },
        );
        llm.routes.storyteller_narration_chat = Some("narr".to_string());
        let (name, _, _) = llm.resolve_chat_route(ChatRoute::StorytellerRefine).unwrap();
        assert_eq!(name, "narr");
    }

    #[test]
    fn unknown_route_reference_is_rejected() {
        let mut config = AppConfig::default();
        config.llm.routes.storyteller_chat = "missing".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_ratio_is_rejected() {
        let mut config = AppConfig::default();
        config.storyteller.narration_ratio = Some((0.6, 0.4));
        assert!(config.validate().is_err());
    }

    #[test]
    fn preset_ratio_applies_when_no_override() {
        let mut section = StorytellerSection::default();
        section.narration_preset = Tier::Long;
        assert_eq!(section.effective_narration_ratio(), (0.65, 0.8));
        section.narration_ratio = Some((0.3, 0.4));
        assert_eq!(section.effective_narration_ratio(), (0.3, 0.4));
    }
}
