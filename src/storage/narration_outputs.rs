//! Structured narration sidecars.
//!
//! One row per narration id, holding the full parsed generation
//! payload. The step executor replays `state_update` from these
//! payloads instead of re-running the LLM.

use rusqlite::{params, OptionalExtension};

use super::types::{InsertResult, NarrationOutputRow};
use super::{Session, StoreResult};

const OUTPUT_COLUMNS: &str = "id, narration_id, book_id, chapter_id, chapter_idx, \
     prompt_version, model, input_hash, payload_json";

impl Session<'_> {
    pub fn get_narration_output(
        &self,
        narration_id: i64,
    ) -> StoreResult<Option<NarrationOutputRow>> {
        let sql =
            format!("SELECT {OUTPUT_COLUMNS} FROM narration_outputs WHERE narration_id = ?1");
        let row = self
            .conn
            .query_row(&sql, [narration_id], map_output)
            .optional()?;
        Ok(row)
    }

    pub fn get_latest_narration_output_for_chapter(
        &self,
        chapter_id: i64,
    ) -> StoreResult<Option<NarrationOutputRow>> {
        let sql = format!(
            "SELECT {OUTPUT_COLUMNS} FROM narration_outputs WHERE chapter_id = ?1
             ORDER BY updated_at DESC, id DESC LIMIT 1"
        );
        let row = self
            .conn
            .query_row(&sql, [chapter_id], map_output)
            .optional()?;
        Ok(row)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn upsert_narration_output(
        &self,
        narration_id: i64,
        book_id: i64,
        chapter_id: i64,
        chapter_idx: i64,
        prompt_version: &str,
        model: &str,
        input_hash: &str,
        payload_json: &str,
    ) -> StoreResult<InsertResult> {
        let existing = self.get_narration_output(narration_id)?;
        self.conn.execute(
            "INSERT INTO narration_outputs
                 (narration_id, book_id, chapter_id, chapter_idx, prompt_version, model,
                  input_hash, payload_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (narration_id) DO UPDATE SET
                 payload_json = excluded.payload_json,
                 prompt_version = excluded.prompt_version,
                 model = excluded.model,
                 input_hash = excluded.input_hash,
                 updated_at = CURRENT_TIMESTAMP",
            params![
                narration_id,
                book_id,
                chapter_id,
                chapter_idx,
                prompt_version,
                model,
                input_hash,
                payload_json
            ],
        )?;
        let id: i64 = self.conn.query_row(
            "SELECT id FROM narration_outputs WHERE narration_id = ?1",
            [narration_id],
            |row| row.get(0),
        )?;
        Ok(InsertResult {
            id,
            inserted: existing.is_none(),
        })
    }
}

fn map_output(row: &rusqlite::Row<'_>) -> rusqlite::Result<NarrationOutputRow> {
    Ok(NarrationOutputRow {
        id: row.get(0)?,
        narration_id: row.get(1)?,
        book_id: row.get(2)?,
        chapter_id: row.get(3)?,
        chapter_idx: row.get(4)?,
        prompt_version: row.get(5)?,
        model: row.get(6)?,
        input_hash: row.get(7)?,
        payload_json: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::storage::Store;

    #[test]
    fn upsert_replaces_payload_for_same_narration() {
        let store = Store::open_in_memory().unwrap();
        store
            .session(|sess| {
                let book = sess.get_or_create_book(None, None, "bh", "x")?;
                let chapter = sess.upsert_chapter(book.id, 1, "t", "c1", 0, 0)?;
                let narration =
                    sess.upsert_narration(book.id, chapter.id, 1, "text", None, "v", "m", "h")?;
                let first = sess.upsert_narration_output(
                    narration.id, book.id, chapter.id, 1, "v", "m", "h", "{\"a\":1}",
                )?;
                assert!(first.inserted);
                let second = sess.upsert_narration_output(
                    narration.id, book.id, chapter.id, 1, "v", "m", "h", "{\"a\":2}",
                )?;
                assert!(!second.inserted);
                assert_eq!(first.id, second.id);
                let row = sess.get_narration_output(narration.id)?.unwrap();
                assert_eq!(row.payload_json, "{\"a\":2}");
                Ok(())
            })
            .unwrap();
    }
}
