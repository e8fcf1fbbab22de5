//! Consistency check: pure, no LLM.
//!
//! Filters the generation output against the known world-state:
//! empty and duplicated key events are dropped, character names are
//! normalized through the alias index, and no-op updates disappear.
//! Bad content is never an error here — it becomes warnings.

use std::collections::{HashMap, HashSet};

use crate::storage::CharacterRow;
use crate::storyteller::state::{CharacterUpdate, KeyEvent, StorytellerState};

const MAX_KEY_EVENTS: usize = 20;

fn normalize_text(value: &str) -> String {
    value.trim().to_string()
}

fn normalize_name_key(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

/// alias (normalized) → canonical name, built from known characters.
pub fn build_alias_index(character_states: &[CharacterRow]) -> HashMap<String, String> {
    let mut index = HashMap::new();
    for character in character_states {
        let canonical = normalize_text(&character.canonical_name);
        if canonical.is_empty() {
            continue;
        }
        index.insert(normalize_name_key(&canonical), canonical.clone());
        for alias in character.aliases() {
            let alias = alias.trim();
            if !alias.is_empty() {
                index.insert(normalize_name_key(alias), canonical.clone());
            }
        }
    }
    index
}

pub fn run(state: &mut StorytellerState) {
    let mut warnings: Vec<String> = Vec::new();
    let mut actions: Vec<String> = Vec::new();

    let recent_event_set: HashSet<String> = state
        .recent_events
        .iter()
        .map(|event| normalize_text(&event.event_summary))
        .filter(|summary| !summary.is_empty())
        .collect();

    let mut sanitized_events: Vec<KeyEvent> = Vec::new();
    let mut seen_event_texts: HashSet<String> = HashSet::new();
    for event in std::mem::take(&mut state.key_events) {
        let what = normalize_text(&event.what);
        if what.is_empty() {
            warnings.push("Dropped empty key_event".to_string());
            continue;
        }
        if seen_event_texts.contains(&what) || recent_event_set.contains(&what) {
            warnings.push(format!("Dropped duplicated key_event: {what}"));
            continue;
        }
        seen_event_texts.insert(what.clone());
        sanitized_events.push(KeyEvent {
            who: normalize_text(&event.who),
            what,
            where_: normalize_text(&event.where_),
            outcome: normalize_text(&event.outcome),
            impact: normalize_text(&event.impact),
            ..Default::default()
        });
    }

    if sanitized_events.len() > MAX_KEY_EVENTS {
        warnings.push(format!("Too many key_events; truncated to {MAX_KEY_EVENTS}"));
        sanitized_events.truncate(MAX_KEY_EVENTS);
    }

    let alias_index = build_alias_index(&state.character_states);
    let mut sanitized_updates: Vec<CharacterUpdate> = Vec::new();
    for update in std::mem::take(&mut state.character_updates) {
        let name_raw = normalize_text(&update.name);
        if name_raw.is_empty() {
            warnings.push("Dropped character_update without name".to_string());
            continue;
        }
        let canonical = alias_index
            .get(&normalize_name_key(&name_raw))
            .cloned()
            .unwrap_or_else(|| name_raw.clone());
        if canonical != name_raw {
            actions.push(format!(
                "Normalized character alias '{name_raw}' -> '{canonical}'"
            ));
        }

        let change_type = {
            let value = normalize_text(&update.change_type);
            if value.is_empty() {
                "status".to_string()
            } else {
                value
            }
        };
        let before = normalize_text(&update.before);
        let after = normalize_text(&update.after);
        if !before.is_empty() && !after.is_empty() && before == after {
            warnings.push(format!(
                "Dropped no-op character_update for '{canonical}' ({change_type})"
            ));
            continue;
        }

        sanitized_updates.push(CharacterUpdate {
            name: canonical,
            name_raw,
            change_type,
            before,
            after,
            evidence: normalize_text(&update.evidence),
            ..Default::default()
        });
    }

    log::info!(
        "Consistency check completed chapter_idx={} key_events_out={} updates_out={} warnings={} actions={}",
        state.chapter_idx,
        sanitized_events.len(),
        sanitized_updates.len(),
        warnings.len(),
        actions.len()
    );

    state.key_events = sanitized_events;
    state.character_updates = sanitized_updates;
    state.consistency_warnings.extend(warnings);
    state.consistency_actions.extend(actions);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PlotEventRow;

    fn character(canonical: &str, aliases: &[&str]) -> CharacterRow {
        CharacterRow {
            id: 1,
            book_id: 1,
            canonical_name: canonical.to_string(),
            aliases_json: serde_json::to_string(aliases).unwrap(),
            first_chapter_idx: Some(1),
            last_chapter_idx: Some(1),
            status: "active".to_string(),
            location: None,
            abilities_json: None,
            relationships_json: None,
            motivation: None,
            notes: None,
        }
    }

    #[test]
    fn dedups_events_and_normalizes_aliases() {
        let mut state = StorytellerState {
            character_states: vec![character("韩立", &["韩跑跑"])],
            key_events: vec![
                KeyEvent {
                    what: "斩杀妖兽".into(),
                    ..Default::default()
                },
                KeyEvent {
                    what: "斩杀妖兽".into(),
                    ..Default::default()
                },
            ],
            character_updates: vec![CharacterUpdate {
                name: "韩跑跑".into(),
                change_type: "status".into(),
                before: "炼气".into(),
                after: "筑基".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        run(&mut state);

        assert_eq!(state.key_events.len(), 1);
        assert_eq!(state.character_updates.len(), 1);
        assert_eq!(state.character_updates[0].name, "韩立");
        assert_eq!(state.character_updates[0].name_raw, "韩跑跑");
        assert!(state
            .consistency_actions
            .contains(&"Normalized character alias '韩跑跑' -> '韩立'".to_string()));
        assert!(state
            .consistency_warnings
            .iter()
            .any(|w| w.contains("Dropped duplicated key_event")));
    }

    #[test]
    fn drops_events_matching_recent_history() {
        let mut state = StorytellerState {
            recent_events: vec![PlotEventRow {
                id: 1,
                book_id: 1,
                chapter_idx: 2,
                event_summary: "入门七玄门".into(),
                involved_characters_json: None,
                event_type: None,
                impact: None,
            }],
            key_events: vec![KeyEvent {
                what: "入门七玄门".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        run(&mut state);
        assert!(state.key_events.is_empty());
    }

    #[test]
    fn drops_empty_and_noop_updates_and_truncates() {
        let mut state = StorytellerState {
            key_events: (0..25)
                .map(|i| KeyEvent {
                    what: format!("event-{i}"),
                    ..Default::default()
                })
                .collect(),
            character_updates: vec![
                CharacterUpdate {
                    name: String::new(),
                    ..Default::default()
                },
                CharacterUpdate {
                    name: "韩立".into(),
                    change_type: "location".into(),
                    before: "青牛镇".into(),
                    after: "青牛镇".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        run(&mut state);
        assert_eq!(state.key_events.len(), 20);
        assert!(state.character_updates.is_empty());
        assert!(state
            .consistency_warnings
            .iter()
            .any(|w| w.contains("truncated to 20")));
        assert!(state
            .consistency_warnings
            .iter()
            .any(|w| w.contains("no-op character_update")));
    }

    #[test]
    fn missing_change_type_defaults_to_status() {
        let mut state = StorytellerState {
            character_updates: vec![CharacterUpdate {
                name: "韩立".into(),
                after: "筑基".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        run(&mut state);
        assert_eq!(state.character_updates[0].change_type, "status");
    }
}
