//! Config loading: YAML layers, dotenv, environment overrides.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use super::schema::AppConfig;
use super::ConfigError;

/// Inputs to a config load, all optional.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub base_dir: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub profile: Option<String>,
    /// Programmatic overrides, merged after file layers.
    pub overrides: Option<Value>,
}

fn read_yaml_layer(path: &Path) -> Result<Value, ConfigError> {
    if !path.exists() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let yaml: serde_yaml::Value =
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
    let json = serde_json::to_value(yaml)?;
    Ok(json)
}

/// Recursive merge: maps merge key-wise, everything else replaces.
fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Read `KEY=VALUE` lines from `.env`, honoring already-set vars.
fn load_dotenv(path: &Path) {
    let Ok(content) = std::fs::read_to_string(path) else {
        return;
    };
    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches('"');
        if !key.is_empty() && std::env::var_os(key).is_none() {
            std::env::set_var(key, value);
        }
    }
}

/// Env var name carrying a base-url override for a provider.
pub fn provider_base_url_override_var(provider_name: &str) -> String {
    let normalized: String = provider_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("NOVEL_SUMMARIZER_LLM_PROVIDER_{normalized}_BASE_URL")
}

/// Apply environment overrides on the merged tree (highest layer).
fn apply_env(tree: &mut Value) {
    if let Some(providers) = tree
        .get_mut("llm")
        .and_then(|llm| llm.get_mut("providers"))
        .and_then(Value::as_object_mut)
    {
        let names: Vec<String> = providers.keys().cloned().collect();
        for name in names {
            if let Ok(base_url) = std::env::var(provider_base_url_override_var(&name)) {
                if let Some(provider) = providers.get_mut(&name).and_then(Value::as_object_mut) {
                    provider.insert("base_url".to_string(), Value::String(base_url));
                }
            }
        }
    }

    if let Ok(data_dir) = std::env::var("NOVEL_SUMMARIZER_DATA_DIR") {
        if let Some(root) = tree.as_object_mut() {
            let app = root
                .entry("app")
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if let Some(app) = app.as_object_mut() {
                app.insert("data_dir".to_string(), Value::String(data_dir));
            }
        }
    }
}

/// Load and validate the effective configuration.
///
/// Layer order: defaults < `configs/default.yaml` <
/// `configs/profiles/<profile>.yaml` < `--config` file <
/// programmatic overrides < environment.
pub fn load_config(options: &LoadOptions) -> Result<AppConfig, ConfigError> {
    let base_dir = options
        .base_dir
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    load_dotenv(&base_dir.join(".env"));

    let mut tree = Value::Object(serde_json::Map::new());
    deep_merge(&mut tree, read_yaml_layer(&base_dir.join("configs/default.yaml"))?);

    if let Some(profile) = &options.profile {
        let profile_path = base_dir.join(format!("configs/profiles/{profile}.yaml"));
        deep_merge(&mut tree, read_yaml_layer(&profile_path)?);
    }
    if let Some(config_path) = &options.config_path {
        deep_merge(&mut tree, read_yaml_layer(config_path)?);
    }
    if let Some(overrides) = options.overrides.clone() {
        deep_merge(&mut tree, overrides);
    }

    apply_env(&mut tree);

    let mut config: AppConfig = serde_json::from_value(tree)?;
    config.validate()?;
    config.resolve_paths(&base_dir);

    log::debug!("Loaded config base_dir={}", base_dir.display());
    Ok(config)
}

/// Env snapshot with secrets masked, for the `config` command.
pub fn masked_env_snapshot(config: &AppConfig) -> BTreeMap<String, Option<String>> {
    let mut snapshot = BTreeMap::new();
    snapshot.insert(
        "NOVEL_SUMMARIZER_DATA_DIR".to_string(),
        std::env::var("NOVEL_SUMMARIZER_DATA_DIR").ok(),
    );

    for (name, provider) in &config.llm.providers {
        let override_var = provider_base_url_override_var(name);
        snapshot.insert(override_var.clone(), std::env::var(&override_var).ok());
        snapshot.insert(
            format!("llm.providers.{name}.base_url"),
            provider.base_url.clone(),
        );
        if let Some(api_key_env) = &provider.api_key_env {
            let masked = std::env::var(api_key_env).ok().map(|_| "***".to_string());
            snapshot.insert(api_key_env.clone(), masked);
        }
    }
    snapshot
}
