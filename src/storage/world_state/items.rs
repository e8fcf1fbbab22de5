//! Item state, unique per `(book_id, name)`.

use rusqlite::{params, OptionalExtension};

use crate::storage::types::{InsertResult, ItemRow};
use crate::storage::{Session, StoreResult};

#[derive(Debug, Clone)]
pub struct ItemUpsert {
    pub name: String,
    pub owner_name: Option<String>,
    pub first_chapter_idx: Option<i64>,
    pub last_chapter_idx: Option<i64>,
    pub description: Option<String>,
    pub status: String,
}

impl Default for ItemUpsert {
    fn default() -> Self {
        Self {
            name: String::new(),
            owner_name: None,
            first_chapter_idx: None,
            last_chapter_idx: None,
            description: None,
            status: "active".to_string(),
        }
    }
}

const ITEM_COLUMNS: &str =
    "id, book_id, name, owner_name, first_chapter_idx, last_chapter_idx, description, status";

impl Session<'_> {
    pub fn list_item_states(
        &self,
        book_id: i64,
        names: Option<&[String]>,
    ) -> StoreResult<Vec<ItemRow>> {
        let rows = match names {
            Some(names) if !names.is_empty() => {
                let placeholders: Vec<String> =
                    (0..names.len()).map(|i| format!("?{}", i + 2)).collect();
                let sql = format!(
                    "SELECT {ITEM_COLUMNS} FROM items
                     WHERE book_id = ?1 AND name IN ({})
                     ORDER BY name",
                    placeholders.join(", ")
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let mut bindings: Vec<&dyn rusqlite::ToSql> = vec![&book_id];
                for name in names {
                    bindings.push(name);
                }
                let rows = stmt.query_map(&bindings[..], map_item)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            Some(_) => Vec::new(),
            None => {
                let sql =
                    format!("SELECT {ITEM_COLUMNS} FROM items WHERE book_id = ?1 ORDER BY name");
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt.query_map([book_id], map_item)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(rows)
    }

    pub fn find_item_state(&self, book_id: i64, name: &str) -> StoreResult<Option<ItemRow>> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM items WHERE book_id = ?1 AND name = ?2");
        let row = self
            .conn
            .query_row(&sql, params![book_id, name], map_item)
            .optional()?;
        Ok(row)
    }

    pub fn upsert_item_state(&self, book_id: i64, upsert: &ItemUpsert) -> StoreResult<InsertResult> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM items WHERE book_id = ?1 AND name = ?2",
                params![book_id, upsert.name],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                self.conn.execute(
                    "UPDATE items SET owner_name = ?2, first_chapter_idx = ?3,
                         last_chapter_idx = ?4, description = ?5, status = ?6
                     WHERE id = ?1",
                    params![
                        id,
                        upsert.owner_name,
                        upsert.first_chapter_idx,
                        upsert.last_chapter_idx,
                        upsert.description,
                        upsert.status,
                    ],
                )?;
                Ok(InsertResult {
                    id,
                    inserted: false,
                })
            }
            None => {
                self.conn.execute(
                    "INSERT INTO items
                         (book_id, name, owner_name, first_chapter_idx, last_chapter_idx,
                          description, status)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        book_id,
                        upsert.name,
                        upsert.owner_name,
                        upsert.first_chapter_idx,
                        upsert.last_chapter_idx,
                        upsert.description,
                        upsert.status,
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

fn map_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<ItemRow> {
    Ok(ItemRow {
        id: row.get(0)?,
        book_id: row.get(1)?,
        name: row.get(2)?,
        owner_name: row.get(3)?,
        first_chapter_idx: row.get(4)?,
        last_chapter_idx: row.get(5)?,
        description: row.get(6)?,
        status: row.get(7)?,
    })
}
