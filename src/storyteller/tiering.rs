//! Chapter tier selection.
//!
//! Rules, in order: `long_every_n`, `long_min_chars`, keyword
//! triggers against the title plus the first 4000 chars, else the
//! default tier. With tiering disabled every chapter gets the base
//! storyteller knobs under the configured preset.

use crate::config::schema::{Tier, TierProfile};
use crate::config::AppConfig;

pub fn decide_tier(
    chapter_idx: i64,
    chapter_title: &str,
    chapter_text: &str,
    config: &AppConfig,
) -> Tier {
    let tiering = &config.storyteller.tiering;
    if !tiering.enabled {
        return config.storyteller.narration_preset;
    }

    if tiering.long_every_n > 0 && chapter_idx > 0 && (chapter_idx as u64) % tiering.long_every_n == 0
    {
        return Tier::Long;
    }

    if tiering.long_min_chars > 0 && chapter_text.chars().count() >= tiering.long_min_chars {
        return Tier::Long;
    }

    if !tiering.long_keyword_triggers.is_empty() {
        let head: String = chapter_text.chars().take(4000).collect();
        let haystack = format!("{chapter_title}\n{head}").to_lowercase();
        for keyword in &tiering.long_keyword_triggers {
            let key = keyword.trim().to_lowercase();
            if !key.is_empty() && haystack.contains(&key) {
                return Tier::Long;
            }
        }
    }

    tiering.default_tier
}

/// The knobs in effect for a chapter of the given tier.
pub fn build_tier_overrides(tier: Tier, config: &AppConfig) -> TierProfile {
    let storyteller = &config.storyteller;
    if !storyteller.tiering.enabled {
        return TierProfile {
            narration_ratio: storyteller.effective_narration_ratio(),
            memory_top_k: storyteller.memory_top_k,
            include_key_dialogue: storyteller.include_key_dialogue,
            include_inner_thoughts: storyteller.include_inner_thoughts,
            refine_enabled: storyteller.refine_enabled,
            entity_extract_mode: storyteller.entity_extract_mode,
        };
    }
    storyteller.tiering.profile(tier).clone()
}

/// Whether any tier can reach into memory at all; gates the
/// retrieval-asset prebuild.
pub fn has_storyteller_memory_retrieval(config: &AppConfig) -> bool {
    let storyteller = &config.storyteller;
    if storyteller.tiering.enabled {
        return [Tier::Short, Tier::Medium, Tier::Long]
            .iter()
            .any(|tier| storyteller.tiering.profile(*tier).memory_top_k > 0);
    }
    storyteller.memory_top_k > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiered_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.storyteller.tiering.enabled = true;
        config.storyteller.tiering.default_tier = Tier::Short;
        config.storyteller.tiering.long_every_n = 10;
        config.storyteller.tiering.long_min_chars = 5000;
        config.storyteller.tiering.long_keyword_triggers = vec!["突破".to_string()];
        config
    }

    #[test]
    fn disabled_tiering_uses_preset() {
        let mut config = AppConfig::default();
        config.storyteller.narration_preset = Tier::Long;
        assert_eq!(decide_tier(3, "t", "text", &config), Tier::Long);
    }

    #[test]
    fn every_n_promotes_to_long() {
        let config = tiered_config();
        assert_eq!(decide_tier(10, "t", "短", &config), Tier::Long);
        assert_eq!(decide_tier(11, "t", "短", &config), Tier::Short);
    }

    #[test]
    fn min_chars_promotes_to_long() {
        let config = tiered_config();
        let long_text = "字".repeat(5000);
        assert_eq!(decide_tier(3, "t", &long_text, &config), Tier::Long);
    }

    #[test]
    fn keyword_trigger_promotes_to_long() {
        let config = tiered_config();
        assert_eq!(decide_tier(3, "第三章 突破瓶颈", "正文", &config), Tier::Long);
        assert_eq!(decide_tier(3, "第三章", "韩立修炼。", &config), Tier::Short);
    }

    #[test]
    fn overrides_follow_base_config_when_disabled() {
        let mut config = AppConfig::default();
        config.storyteller.memory_top_k = 3;
        config.storyteller.refine_enabled = false;
        let overrides = build_tier_overrides(Tier::Medium, &config);
        assert_eq!(overrides.memory_top_k, 3);
        assert!(!overrides.refine_enabled);
    }

    #[test]
    fn memory_gate_checks_all_tiers() {
        let mut config = tiered_config();
        config.storyteller.tiering.short.memory_top_k = 0;
        config.storyteller.tiering.medium.memory_top_k = 0;
        config.storyteller.tiering.long.memory_top_k = 0;
        assert!(!has_storyteller_memory_retrieval(&config));
        config.storyteller.tiering.long.memory_top_k = 4;
        assert!(has_storyteller_memory_retrieval(&config));
    }
}
