//! Character state, unique per `(book_id, canonical_name)`.

use rusqlite::{params, OptionalExtension};

use crate::storage::types::{CharacterRow, InsertResult};
use crate::storage::{Session, StoreResult};

/// Field bundle for a character upsert. Aliases are stored as a
/// sorted, deduplicated JSON array.
#[derive(Debug, Clone)]
pub struct CharacterUpsert {
    pub canonical_name: String,
    pub aliases: Vec<String>,
    pub first_chapter_idx: Option<i64>,
    pub last_chapter_idx: Option<i64>,
    pub status: String,
    pub location: Option<String>,
    pub abilities_json: Option<String>,
    pub relationships_json: Option<String>,
    pub motivation: Option<String>,
    pub notes: Option<String>,
}

impl Default for CharacterUpsert {
    fn default() -> Self {
        Self {
            canonical_name: String::new(),
            aliases: Vec::new(),
            first_chapter_idx: None,
            last_chapter_idx: None,
            status: "active".to_string(),
            location: None,
            abilities_json: None,
            relationships_json: None,
            motivation: None,
            notes: None,
        }
    }
}

const CHARACTER_COLUMNS: &str = "id, book_id, canonical_name, aliases_json, first_chapter_idx, \
     last_chapter_idx, status, location, abilities_json, relationships_json, motivation, notes";

impl Session<'_> {
    /// List character states, optionally filtered to a name set.
    pub fn list_character_states(
        &self,
        book_id: i64,
        canonical_names: Option<&[String]>,
    ) -> StoreResult<Vec<CharacterRow>> {
        let rows = match canonical_names {
            Some(names) if !names.is_empty() => {
                let placeholders: Vec<String> =
                    (0..names.len()).map(|i| format!("?{}", i + 2)).collect();
                let sql = format!(
                    "SELECT {CHARACTER_COLUMNS} FROM characters
                     WHERE book_id = ?1 AND canonical_name IN ({})
                     ORDER BY canonical_name",
                    placeholders.join(", ")
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let mut bindings: Vec<&dyn rusqlite::ToSql> = vec![&book_id];
                for name in names {
                    bindings.push(name);
                }
                let rows = stmt.query_map(&bindings[..], map_character)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            Some(_) => Vec::new(),
            None => {
                let sql = format!(
                    "SELECT {CHARACTER_COLUMNS} FROM characters
                     WHERE book_id = ?1 ORDER BY canonical_name"
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt.query_map([book_id], map_character)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(rows)
    }

    pub fn find_character_state(
        &self,
        book_id: i64,
        canonical_name: &str,
    ) -> StoreResult<Option<CharacterRow>> {
        let sql = format!(
            "SELECT {CHARACTER_COLUMNS} FROM characters
             WHERE book_id = ?1 AND canonical_name = ?2"
        );
        let row = self
            .conn
            .query_row(&sql, params![book_id, canonical_name], map_character)
            .optional()?;
        Ok(row)
    }

    pub fn upsert_character_state(
        &self,
        book_id: i64,
        upsert: &CharacterUpsert,
    ) -> StoreResult<InsertResult> {
        let mut aliases: Vec<String> = upsert
            .aliases
            .iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        aliases.sort();
        aliases.dedup();
        let aliases_json = serde_json::to_string(&aliases)?;

        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM characters WHERE book_id = ?1 AND canonical_name = ?2",
                params![book_id, upsert.canonical_name],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                self.conn.execute(
                    "UPDATE characters SET
                         aliases_json = ?2, first_chapter_idx = ?3, last_chapter_idx = ?4,
                         status = ?5, location = ?6, abilities_json = ?7,
                         relationships_json = ?8, motivation = ?9, notes = ?10
                     WHERE id = ?1",
                    params![
                        id,
                        aliases_json,
                        upsert.first_chapter_idx,
                        upsert.last_chapter_idx,
                        upsert.status,
                        upsert.location,
                        upsert.abilities_json,
                        upsert.relationships_json,
                        upsert.motivation,
                        upsert.notes,
                    ],
                )?;
                Ok(InsertResult {
                    id,
                    inserted: false,
                })
            }
            None => {
                self.conn.execute(
                    "INSERT INTO characters
                         (book_id, canonical_name, aliases_json, first_chapter_idx,
                          last_chapter_idx, status, location, abilities_json,
                          relationships_json, motivation, notes)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        book_id,
                        upsert.canonical_name,
                        aliases_json,
                        upsert.first_chapter_idx,
                        upsert.last_chapter_idx,
                        upsert.status,
                        upsert.location,
                        upsert.abilities_json,
                        upsert.relationships_json,
                        upsert.motivation,
                        upsert.notes,
                    ],
                )?;
                Ok(InsertResult {
                    id: self.conn.last_insert_rowid(),
                    inserted: true,
                })
            }
        }
    }
}

fn map_character(row: &rusqlite::Row<'_>) -> rusqlite::Result<CharacterRow> {
    Ok(CharacterRow {
        id: row.get(0)?,
        book_id: row.get(1)?,
        canonical_name: row.get(2)?,
        aliases_json: row.get(3)?,
        first_chapter_idx: row.get(4)?,
        last_chapter_idx: row.get(5)?,
        status: row.get(6)?,
        location: row.get(7)?,
        abilities_json: row.get(8)?,
        relationships_json: row.get(9)?,
        motivation: row.get(10)?,
        notes: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;

    #[test]
    fn aliases_are_stored_sorted_and_unique() {
        let store = Store::open_in_memory().unwrap();
        store
            .session(|sess| {
                let book = sess.get_or_create_book(None, None, "bh", "x")?;
                sess.upsert_character_state(
                    book.id,
                    &CharacterUpsert {
                        canonical_name: "韩立".into(),
                        aliases: vec!["韩跑跑".into(), "厉飞雨".into(), "韩跑跑".into(), " ".into()],
                        ..Default::default()
                    },
                )?;
                let row = sess.find_character_state(book.id, "韩立")?.unwrap();
                let mut expected = vec!["韩跑跑".to_string(), "厉飞雨".to_string()];
                expected.sort();
                assert_eq!(row.aliases(), expected);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn name_filter_limits_results() {
        let store = Store::open_in_memory().unwrap();
        store
            .session(|sess| {
                let book = sess.get_or_create_book(None, None, "bh2", "x")?;
                for name in ["韩立", "墨大夫", "厉飞雨"] {
                    sess.upsert_character_state(
                        book.id,
                        &CharacterUpsert {
                            canonical_name: name.into(),
                            ..Default::default()
                        },
                    )?;
                }
                let filtered = sess.list_character_states(
                    book.id,
                    Some(&["韩立".to_string(), "厉飞雨".to_string()]),
                )?;
                assert_eq!(filtered.len(), 2);
                let empty = sess.list_character_states(book.id, Some(&[]))?;
                assert!(empty.is_empty());
                let all = sess.list_character_states(book.id, None)?;
                assert_eq!(all.len(), 3);
                Ok(())
            })
            .unwrap();
    }
}
