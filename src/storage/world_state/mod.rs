//! World-state tables and the checkpoint/restore protocol.
//!
//! Characters, items, plot events and world facts are mutated only by
//! the storyteller graph and the step executor. Checkpoints freeze the
//! union of all four tables immediately after a chapter commit;
//! restore clears the live tables for the book and bulk-inserts the
//! snapshot rows through a column whitelist, preserving row ids so
//! cross-references and ordering keys survive.

pub mod characters;
pub mod checkpoints;
pub mod items;
pub mod plot_events;
pub mod world_facts;

use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hashing::sha256_text;

use super::types::{CharacterRow, ItemRow, PlotEventRow, WorldFactRow, WorldStateCheckpointRow};
use super::{Session, StoreError, StoreResult};

pub use characters::CharacterUpsert;
pub use items::ItemUpsert;

/// Full world-state of one book at a step boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldStateSnapshot {
    pub characters: Vec<CharacterRow>,
    pub items: Vec<ItemRow>,
    pub plot_events: Vec<PlotEventRow>,
    pub world_facts: Vec<WorldFactRow>,
}

impl WorldStateSnapshot {
    /// Canonical JSON: serde_json's map ordering is stable (sorted),
    /// and each list is emitted in ascending id order, so equal state
    /// always serializes to equal bytes.
    pub fn to_canonical_json(&self) -> StoreResult<String> {
        Ok(serde_json::to_string(&serde_json::to_value(self)?)?)
    }

    pub fn content_hash(&self) -> StoreResult<String> {
        Ok(sha256_text(&self.to_canonical_json()?))
    }
}

impl Session<'_> {
    /// Capture the book's world-state, lists ordered by id.
    pub fn build_world_state_snapshot(&self, book_id: i64) -> StoreResult<WorldStateSnapshot> {
        let mut characters = self.list_character_states(book_id, None)?;
        characters.sort_by_key(|c| c.id);
        let mut items = self.list_item_states(book_id, None)?;
        items.sort_by_key(|i| i.id);
        let plot_events = self.list_plot_events_by_book(book_id)?;
        let mut world_facts = self.list_world_facts(book_id, i64::MAX)?;
        world_facts.sort_by_key(|f| f.id);
        Ok(WorldStateSnapshot {
            characters,
            items,
            plot_events,
            world_facts,
        })
    }

    /// Hard-delete all four world-state tables for a book. Used by
    /// restore; checkpoints themselves are never deleted.
    pub fn clear_world_state_for_book(&self, book_id: i64) -> StoreResult<()> {
        for table in ["plot_events", "characters", "items", "world_facts"] {
            self.conn
                .execute(&format!("DELETE FROM {table} WHERE book_id = ?1"), [book_id])?;
        }
        Ok(())
    }

    /// Restore the snapshot stored in a checkpoint: clear, then
    /// bulk-insert through the per-table column whitelist. Unknown
    /// snapshot keys are dropped; row ids are preserved.
    pub fn restore_world_state_checkpoint(
        &self,
        checkpoint: &WorldStateCheckpointRow,
    ) -> StoreResult<()> {
        let payload: Value = serde_json::from_str(&checkpoint.snapshot_json)?;
        let Value::Object(payload) = payload else {
            return Err(StoreError::Integrity(
                "checkpoint snapshot_json must decode to a JSON object".into(),
            ));
        };

        let book_id = checkpoint.book_id;
        self.clear_world_state_for_book(book_id)?;

        for row in rows_of(&payload, "characters")? {
            self.conn.execute(
                "INSERT INTO characters
                     (id, book_id, canonical_name, aliases_json, first_chapter_idx,
                      last_chapter_idx, status, location, abilities_json, relationships_json,
                      motivation, notes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    v_i64(row, "id"),
                    book_id,
                    v_str(row, "canonical_name").unwrap_or_default(),
                    v_str(row, "aliases_json").unwrap_or_else(|| "[]".to_string()),
                    v_i64(row, "first_chapter_idx"),
                    v_i64(row, "last_chapter_idx"),
                    v_str(row, "status").unwrap_or_else(|| "active".to_string()),
                    v_str(row, "location"),
                    v_str(row, "abilities_json"),
                    v_str(row, "relationships_json"),
                    v_str(row, "motivation"),
                    v_str(row, "notes"),
                ],
            )?;
        }

        for row in rows_of(&payload, "items")? {
            self.conn.execute(
                "INSERT INTO items
                     (id, book_id, name, owner_name, first_chapter_idx, last_chapter_idx,
                      description, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    v_i64(row, "id"),
                    book_id,
                    v_str(row, "name").unwrap_or_default(),
                    v_str(row, "owner_name"),
                    v_i64(row, "first_chapter_idx"),
                    v_i64(row, "last_chapter_idx"),
                    v_str(row, "description"),
                    v_str(row, "status").unwrap_or_else(|| "active".to_string()),
                ],
            )?;
        }

        for row in rows_of(&payload, "plot_events")? {
            self.conn.execute(
                "INSERT INTO plot_events
                     (id, book_id, chapter_idx, event_summary, involved_characters_json,
                      event_type, impact)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    v_i64(row, "id"),
                    book_id,
                    v_i64(row, "chapter_idx").unwrap_or(0),
                    v_str(row, "event_summary").unwrap_or_default(),
                    v_str(row, "involved_characters_json"),
                    v_str(row, "event_type"),
                    v_str(row, "impact"),
                ],
            )?;
        }

        for row in rows_of(&payload, "world_facts")? {
            self.conn.execute(
                "INSERT INTO world_facts
                     (id, book_id, fact_key, fact_value, confidence, source_chapter_idx,
                      source_excerpt)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    v_i64(row, "id"),
                    book_id,
                    v_str(row, "fact_key").unwrap_or_default(),
                    v_str(row, "fact_value").unwrap_or_default(),
                    v_f64(row, "confidence").unwrap_or(0.8),
                    v_i64(row, "source_chapter_idx"),
                    v_str(row, "source_excerpt"),
                ],
            )?;
        }

        Ok(())
    }
}

fn rows_of<'a>(
    payload: &'a serde_json::Map<String, Value>,
    key: &str,
) -> StoreResult<Vec<&'a serde_json::Map<String, Value>>> {
    match payload.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(rows)) => Ok(rows.iter().filter_map(Value::as_object).collect()),
        Some(_) => Err(StoreError::Integrity(format!(
            "checkpoint snapshot field '{key}' must be a list"
        ))),
    }
}

fn v_str(row: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    row.get(key).and_then(Value::as_str).map(str::to_string)
}

fn v_i64(row: &serde_json::Map<String, Value>, key: &str) -> Option<i64> {
    row.get(key).and_then(Value::as_i64)
}

fn v_f64(row: &serde_json::Map<String, Value>, key: &str) -> Option<f64> {
    row.get(key).and_then(Value::as_f64)
}

#[cfg(test)]
mod tests {
    use crate::storage::{Store, WorldStateCheckpointRow};
    use crate::storage::world_state::{CharacterUpsert, ItemUpsert};

    fn seed_book(store: &Store) -> i64 {
        store
            .session(|sess| Ok(sess.get_or_create_book(None, None, "bh", "x.txt")?.id))
            .unwrap()
    }

    #[test]
    fn restore_reverts_later_mutations() {
        let store = Store::open_in_memory().unwrap();
        let book_id = seed_book(&store);

        // Chapter 1 state.
        store
            .session(|sess| {
                sess.upsert_character_state(
                    book_id,
                    &CharacterUpsert {
                        canonical_name: "韩立".into(),
                        aliases: vec!["韩跑跑".into()],
                        first_chapter_idx: Some(1),
                        last_chapter_idx: Some(1),
                        ..Default::default()
                    },
                )?;
                sess.insert_plot_event(book_id, 1, "获得掌天瓶", None, None, None)?;
                Ok(())
            })
            .unwrap();

        let snapshot = store
            .read(|sess| sess.build_world_state_snapshot(book_id))
            .unwrap();
        let snapshot_json = snapshot.to_canonical_json().unwrap();
        let snapshot_hash = snapshot.content_hash().unwrap();
        let checkpoint_id = store
            .session(|sess| {
                sess.upsert_world_state_checkpoint(book_id, 1, 1, &snapshot_json, &snapshot_hash)
            })
            .unwrap();

        // Mutations after the checkpoint.
        store
            .session(|sess| {
                sess.upsert_character_state(
                    book_id,
                    &CharacterUpsert {
                        canonical_name: "韩立".into(),
                        aliases: vec!["韩跑跑".into()],
                        status: "injured".into(),
                        first_chapter_idx: Some(1),
                        last_chapter_idx: Some(2),
                        ..Default::default()
                    },
                )?;
                sess.insert_plot_event(book_id, 2, "突破瓶颈", None, None, None)?;
                sess.upsert_item_state(
                    book_id,
                    &ItemUpsert {
                        name: "掌天瓶".into(),
                        owner_name: Some("韩立".into()),
                        ..Default::default()
                    },
                )?;
                Ok(())
            })
            .unwrap();

        let checkpoint = store
            .read(|sess| sess.get_latest_checkpoint_at_or_before(book_id, 1))
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.id, checkpoint_id.id);
        store
            .session(|sess| sess.restore_world_state_checkpoint(&checkpoint))
            .unwrap();

        let characters = store
            .read(|sess| sess.list_character_states(book_id, None))
            .unwrap();
        assert_eq!(characters.len(), 1);
        assert_eq!(characters[0].canonical_name, "韩立");
        assert_eq!(characters[0].status, "active");
        assert_eq!(characters[0].aliases(), vec!["韩跑跑".to_string()]);

        let events = store
            .read(|sess| sess.list_plot_events_by_book(book_id))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_summary, "获得掌天瓶");
        assert_eq!(events[0].chapter_idx, 1);

        let items = store
            .read(|sess| sess.list_item_states(book_id, None))
            .unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn restore_then_resnapshot_reproduces_the_hash() {
        let store = Store::open_in_memory().unwrap();
        let book_id = seed_book(&store);
        store
            .session(|sess| {
                sess.upsert_character_state(
                    book_id,
                    &CharacterUpsert {
                        canonical_name: "韩立".into(),
                        first_chapter_idx: Some(1),
                        last_chapter_idx: Some(1),
                        ..Default::default()
                    },
                )?;
                sess.upsert_world_fact(book_id, "character:韩立:status", "active", 0.85, Some(1), None)?;
                Ok(())
            })
            .unwrap();

        let snapshot = store
            .read(|sess| sess.build_world_state_snapshot(book_id))
            .unwrap();
        let original_hash = snapshot.content_hash().unwrap();
        let checkpoint = WorldStateCheckpointRow {
            id: 0,
            book_id,
            chapter_idx: 1,
            step_size: 1,
            snapshot_json: snapshot.to_canonical_json().unwrap(),
            snapshot_hash: original_hash.clone(),
        };

        store
            .session(|sess| {
                sess.insert_plot_event(book_id, 2, "noise", None, None, None)?;
                sess.restore_world_state_checkpoint(&checkpoint)?;
                Ok(())
            })
            .unwrap();

        let restored = store
            .read(|sess| sess.build_world_state_snapshot(book_id))
            .unwrap();
        assert_eq!(restored.content_hash().unwrap(), original_hash);
    }

    #[test]
    fn restore_ignores_unknown_snapshot_keys() {
        let store = Store::open_in_memory().unwrap();
        let book_id = seed_book(&store);
        let checkpoint = WorldStateCheckpointRow {
            id: 0,
            book_id,
            chapter_idx: 1,
            step_size: 1,
            snapshot_json: r#"{
                "characters": [{"id": 7, "canonical_name": "韩立", "future_field": true}],
                "items": [], "plot_events": [], "world_facts": []
            }"#
            .to_string(),
            snapshot_hash: "h".to_string(),
        };
        store
            .session(|sess| sess.restore_world_state_checkpoint(&checkpoint))
            .unwrap();
        let characters = store
            .read(|sess| sess.list_character_states(book_id, None))
            .unwrap();
        assert_eq!(characters.len(), 1);
        assert_eq!(characters[0].id, 7);
    }
}
