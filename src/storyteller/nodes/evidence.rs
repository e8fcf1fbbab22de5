//! Evidence verification: pure, no LLM.
//!
//! Every claim (key event, character update, new item) must find
//! support in the chapter text or the awakened memories. Support is
//! the max of: an exact key-phrase substring (1.0), the whole claim
//! as a substring (1.0), or token overlap between claim and source.
//! Claims below `evidence_min_support_score` are dropped and counted.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::AppConfig;
use crate::storyteller::state::{
    CharacterUpdate, EvidenceReport, KeyEvent, NewItem, StorytellerState,
};

static CLAIM_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[\u{4e00}-\u{9fff}]{2,8}|[A-Za-z0-9_]{2,20}").expect("static regex")
});

const SNIPPET_CHARS: usize = 120;

struct Source {
    source_type: String,
    text: String,
}

fn normalize(value: &str) -> String {
    value.trim().to_string()
}

fn tokens(text: &str) -> std::collections::HashSet<String> {
    CLAIM_TOKEN
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}

fn join_parts(parts: &[String]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join(" ")
}

fn claim_text_from_event(event: &KeyEvent) -> String {
    join_parts(&[
        normalize(&event.who),
        normalize(&event.what),
        normalize(&event.where_),
        normalize(&event.outcome),
        normalize(&event.impact),
    ])
}

fn claim_text_from_update(update: &CharacterUpdate) -> String {
    join_parts(&[
        normalize(&update.name),
        normalize(&update.change_type),
        normalize(&update.after),
        normalize(&update.evidence),
    ])
}

fn claim_text_from_item(item: &NewItem) -> String {
    join_parts(&[
        normalize(&item.name),
        normalize(&item.owner),
        normalize(&item.description),
    ])
}

fn source_snippet(text: &str) -> String {
    text.chars().take(SNIPPET_CHARS).collect::<String>().trim().to_string()
}

/// `(score, source_type, snippet)` of the best-supporting source.
fn best_support_score(
    claim_text: &str,
    sources: &[Source],
    key_phrases: &[String],
) -> (f64, String, String) {
    if claim_text.is_empty() {
        return (0.0, String::new(), String::new());
    }

    let claim_tokens = tokens(claim_text);
    let mut best_score = 0.0_f64;
    let mut best_source_type = String::new();
    let mut best_snippet = String::new();

    for source in sources {
        if source.text.is_empty() {
            continue;
        }

        for phrase in key_phrases {
            let phrase = phrase.trim();
            if !phrase.is_empty() && source.text.contains(phrase) {
                return (1.0, source.source_type.clone(), source_snippet(&source.text));
            }
        }
        if source.text.contains(claim_text) {
            return (1.0, source.source_type.clone(), source_snippet(&source.text));
        }

        let score = if claim_tokens.is_empty() {
            0.0
        } else {
            let source_tokens = tokens(&source.text);
            let overlap = claim_tokens.intersection(&source_tokens).count();
            overlap as f64 / claim_tokens.len().max(1) as f64
        };
        if score > best_score {
            best_score = score;
            best_source_type = source.source_type.clone();
            best_snippet = source_snippet(&source.text);
        }
    }

    (best_score, best_source_type, best_snippet)
}

fn build_sources(state: &StorytellerState, max_snippets: usize) -> Vec<Source> {
    let mut sources = Vec::new();
    let chapter_text = normalize(&state.chapter_text);
    if !chapter_text.is_empty() {
        sources.push(Source {
            source_type: "chapter".to_string(),
            text: chapter_text,
        });
    }
    for memory in state.memories().iter().take(max_snippets) {
        let text = normalize(&memory.text);
        if text.is_empty() {
            continue;
        }
        let source_type = if memory.source_type.is_empty() {
            "memory".to_string()
        } else {
            memory.source_type.clone()
        };
        sources.push(Source { source_type, text });
    }
    sources
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

pub fn run(state: &mut StorytellerState, config: &AppConfig) {
    let min_score = config.storyteller.evidence_min_support_score;
    let sources = build_sources(state, config.storyteller.evidence_max_snippets);

    let mut warnings = Vec::new();
    let mut total_claims = 0_usize;
    let mut supported_claims = 0_usize;

    let mut supported_events = Vec::new();
    for mut event in std::mem::take(&mut state.key_events) {
        total_claims += 1;
        let claim_text = claim_text_from_event(&event);
        let key_phrases = vec![normalize(&event.what)];
        let (score, source_type, snippet) = best_support_score(&claim_text, &sources, &key_phrases);
        if score < min_score {
            warnings.push(format!("Evidence rejected key_event: {}", event.what));
            continue;
        }
        supported_claims += 1;
        event.evidence_source_type = Some(source_type);
        event.evidence_quote = Some(snippet);
        event.evidence_score = Some(round4(score));
        supported_events.push(event);
    }

    let mut supported_updates = Vec::new();
    for mut update in std::mem::take(&mut state.character_updates) {
        total_claims += 1;
        let claim_text = claim_text_from_update(&update);
        let key_phrases = vec![normalize(&update.evidence), normalize(&update.after)];
        let (score, source_type, snippet) = best_support_score(&claim_text, &sources, &key_phrases);
        if score < min_score {
            warnings.push(format!("Evidence rejected character_update: {}", update.name));
            continue;
        }
        supported_claims += 1;
        update.evidence_source_type = Some(source_type);
        update.evidence_quote = Some(snippet);
        update.evidence_score = Some(round4(score));
        supported_updates.push(update);
    }

    let mut supported_items = Vec::new();
    for mut item in std::mem::take(&mut state.new_items) {
        total_claims += 1;
        let claim_text = claim_text_from_item(&item);
        let key_phrases = vec![
            normalize(&item.name),
            normalize(&item.description),
            normalize(&item.owner),
        ];
        let (score, source_type, snippet) = best_support_score(&claim_text, &sources, &key_phrases);
        if score < min_score {
            warnings.push(format!("Evidence rejected new_item: {}", item.name));
            continue;
        }
        supported_claims += 1;
        item.evidence_source_type = Some(source_type);
        item.evidence_quote = Some(snippet);
        item.evidence_score = Some(round4(score));
        supported_items.push(item);
    }

    let unsupported_claims = total_claims.saturating_sub(supported_claims);
    if unsupported_claims > 0 {
        state
            .consistency_actions
            .push(format!("Evidence filtered unsupported claims: {unsupported_claims}"));
    }

    state.key_events = supported_events;
    state.character_updates = supported_updates;
    state.new_items = supported_items;
    state.consistency_warnings.extend(warnings);
    state.evidence_report = Some(EvidenceReport {
        total_claims,
        supported_claims,
        unsupported_claims,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::MemoryHit;

    fn memory(text: &str) -> MemoryHit {
        MemoryHit {
            source_type: "narration".into(),
            source_id: 1,
            chapter_idx: 1,
            chapter_title: "第1章".into(),
            text: text.into(),
            vector_rank_score: 0.5,
            keyword_rank_score: 0.0,
            proximity_score: 0.5,
            score: 0.45,
        }
    }

    #[test]
    fn gate_accepts_supported_and_rejects_unsupported_claims() {
        let mut state = StorytellerState {
            chapter_text: "韩立在秘境中斩杀妖兽，获得掌天瓶。".into(),
            awakened_memories: Some(vec![memory("韩立需要突破瓶颈")]),
            key_events: vec![
                KeyEvent {
                    who: "韩立".into(),
                    what: "斩杀妖兽".into(),
                    ..Default::default()
                },
                KeyEvent {
                    who: "韩立".into(),
                    what: "飞升灵界".into(),
                    ..Default::default()
                },
            ],
            character_updates: vec![CharacterUpdate {
                name: "韩立".into(),
                change_type: "status".into(),
                before: "炼气".into(),
                after: "筑基".into(),
                evidence: "突破瓶颈".into(),
                ..Default::default()
            }],
            new_items: vec![NewItem {
                name: "掌天瓶".into(),
                owner: "韩立".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let config = AppConfig::default();
        run(&mut state, &config);

        let report = state.evidence_report.unwrap();
        assert_eq!(report.total_claims, 4);
        assert_eq!(report.supported_claims, 3);
        assert_eq!(report.unsupported_claims, 1);

        assert_eq!(state.key_events.len(), 1);
        assert_eq!(state.key_events[0].what, "斩杀妖兽");
        assert_eq!(state.key_events[0].evidence_score, Some(1.0));
        assert_eq!(
            state.key_events[0].evidence_source_type.as_deref(),
            Some("chapter")
        );

        assert_eq!(state.character_updates.len(), 1);
        assert_eq!(
            state.character_updates[0].evidence_source_type.as_deref(),
            Some("narration")
        );

        assert_eq!(state.new_items.len(), 1);
        assert_eq!(state.new_items[0].name, "掌天瓶");

        assert!(state
            .consistency_warnings
            .iter()
            .any(|w| w.contains("飞升灵界")));
        assert!(state
            .consistency_actions
            .iter()
            .any(|a| a.contains("unsupported claims: 1")));
    }

    #[test]
    fn accepted_claims_meet_the_threshold() {
        let mut state = StorytellerState {
            chapter_text: "韩立出门赶集。".into(),
            key_events: vec![KeyEvent {
                who: "韩立".into(),
                what: "出门赶集".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut config = AppConfig::default();
        config.storyteller.evidence_min_support_score = 0.3;
        run(&mut state, &config);
        for event in &state.key_events {
            assert!(event.evidence_score.unwrap() >= 0.3);
        }
    }

    #[test]
    fn memory_snippet_cap_limits_sources() {
        let state = StorytellerState {
            chapter_text: "正文".into(),
            awakened_memories: Some(vec![memory("a1"), memory("a2"), memory("a3"), memory("a4")]),
            ..Default::default()
        };
        let sources = build_sources(&state, 2);
        // chapter + two memories
        assert_eq!(sources.len(), 3);
    }
}
