//! Namespaced world facts, unique per `(book_id, fact_key)`.
//!
//! Key shapes: `event:<idx>:<hash12>`, `character:<name>:status`,
//! `character:<name>:location`, `item:<name>:owner`.

use rusqlite::{params, OptionalExtension};

use crate::storage::types::{InsertResult, WorldFactRow};
use crate::storage::{Session, StoreResult};

const FACT_COLUMNS: &str =
    "id, book_id, fact_key, fact_value, confidence, source_chapter_idx, source_excerpt";

impl Session<'_> {
    pub fn list_world_facts(&self, book_id: i64, limit: i64) -> StoreResult<Vec<WorldFactRow>> {
        let sql = format!(
            "SELECT {FACT_COLUMNS} FROM world_facts WHERE book_id = ?1
             ORDER BY fact_key LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![book_id, limit], map_fact)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn find_world_fact(&self, book_id: i64, fact_key: &str) -> StoreResult<Option<WorldFactRow>> {
        let sql = format!("SELECT {FACT_COLUMNS} FROM world_facts WHERE book_id = ?1 AND fact_key = ?2");
        let row = self
            .conn
            .query_row(&sql, params![book_id, fact_key], map_fact)
            .optional()?;
        Ok(row)
    }

    pub fn upsert_world_fact(
        &self,
        book_id: i64,
        fact_key: &str,
        fact_value: &str,
        confidence: f64,
        source_chapter_idx: Option<i64>,
        source_excerpt: Option<&str>,
    ) -> StoreResult<InsertResult> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM world_facts WHERE book_id = ?1 AND fact_key = ?2",
                params![book_id, fact_key],
                |row| row.get(0),
            )
            .optional()?;
        self.conn.execute(
            "INSERT INTO world_facts
                 (book_id, fact_key, fact_value, confidence, source_chapter_idx, source_excerpt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (book_id, fact_key) DO UPDATE SET
                 fact_value = excluded.fact_value,
                 confidence = excluded.confidence,
                 source_chapter_idx = excluded.source_chapter_idx,
                 source_excerpt = excluded.source_excerpt",
            params![
                book_id,
                fact_key,
                fact_value,
                confidence,
                source_chapter_idx,
                source_excerpt
            ],
        )?;
        let id: i64 = self.conn.query_row(
            "SELECT id FROM world_facts WHERE book_id = ?1 AND fact_key = ?2",
            params![book_id, fact_key],
            |row| row.get(0),
        )?;
        Ok(InsertResult {
            id,
            inserted: existing.is_none(),
        })
    }
}

fn map_fact(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorldFactRow> {
    Ok(WorldFactRow {
        id: row.get(0)?,
        book_id: row.get(1)?,
        fact_key: row.get(2)?,
        fact_value: row.get(3)?,
        confidence: row.get(4)?,
        source_chapter_idx: row.get(5)?,
        source_excerpt: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::storage::Store;

    #[test]
    fn fact_upsert_replaces_value_and_confidence() {
        let store = Store::open_in_memory().unwrap();
        store
            .session(|sess| {
                let book = sess.get_or_create_book(None, None, "bh", "x")?;
                let first = sess.upsert_world_fact(
                    book.id, "character:韩立:status", "active", 0.85, Some(1), None,
                )?;
                let second = sess.upsert_world_fact(
                    book.id, "character:韩立:status", "injured", 0.85, Some(3), None,
                )?;
                assert!(first.inserted);
                assert!(!second.inserted);
                let fact = sess.find_world_fact(book.id, "character:韩立:status")?.unwrap();
                assert_eq!(fact.fact_value, "injured");
                assert_eq!(fact.source_chapter_idx, Some(3));
                Ok(())
            })
            .unwrap();
    }
}
