//! Narration rows and the narration FTS index.
//!
//! At most one narration exists per `(chapter_id, prompt_version,
//! model, input_hash)`. "Latest" for a chapter is the row with the
//! greatest `created_at`, ties broken by greatest `id`.

use rusqlite::{params, OptionalExtension};

use super::types::{InsertResult, NarrationRow, SearchHitRow};
use super::{Session, StoreResult};

const NARRATION_COLUMNS: &str = "id, book_id, chapter_id, chapter_idx, narration_text, \
     key_events_json, prompt_version, model, input_hash, created_at";

impl Session<'_> {
    pub fn get_narration(
        &self,
        chapter_id: i64,
        prompt_version: &str,
        model: &str,
        input_hash: &str,
    ) -> StoreResult<Option<NarrationRow>> {
        let sql = format!(
            "SELECT {NARRATION_COLUMNS} FROM narrations
             WHERE chapter_id = ?1 AND prompt_version = ?2 AND model = ?3 AND input_hash = ?4"
        );
        let row = self
            .conn
            .query_row(
                &sql,
                params![chapter_id, prompt_version, model, input_hash],
                map_narration,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_latest_narration(&self, chapter_id: i64) -> StoreResult<Option<NarrationRow>> {
        let sql = format!(
            "SELECT {NARRATION_COLUMNS} FROM narrations WHERE chapter_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        let row = self
            .conn
            .query_row(&sql, [chapter_id], map_narration)
            .optional()?;
        Ok(row)
    }

    pub fn list_narrations_by_book(&self, book_id: i64) -> StoreResult<Vec<NarrationRow>> {
        let sql = format!(
            "SELECT {NARRATION_COLUMNS} FROM narrations WHERE book_id = ?1 ORDER BY chapter_idx, id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([book_id], map_narration)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// The latest narration of every chapter that has one.
    pub fn list_latest_narrations_by_book(&self, book_id: i64) -> StoreResult<Vec<NarrationRow>> {
        let sql = format!(
            "SELECT {NARRATION_COLUMNS} FROM narrations n
             WHERE n.book_id = ?1
               AND n.id = (
                   SELECT n2.id FROM narrations n2 WHERE n2.chapter_id = n.chapter_id
                   ORDER BY n2.created_at DESC, n2.id DESC LIMIT 1
               )
             ORDER BY n.chapter_idx"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([book_id], map_narration)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Insert-if-absent on the content-addressed identity.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_narration(
        &self,
        book_id: i64,
        chapter_id: i64,
        chapter_idx: i64,
        narration_text: &str,
        key_events_json: Option<&str>,
        prompt_version: &str,
        model: &str,
        input_hash: &str,
    ) -> StoreResult<InsertResult> {
        let changed = self.conn.execute(
            "INSERT INTO narrations
                 (book_id, chapter_id, chapter_idx, narration_text, key_events_json,
                  prompt_version, model, input_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (chapter_id, prompt_version, model, input_hash) DO NOTHING",
            params![
                book_id,
                chapter_id,
                chapter_idx,
                narration_text,
                key_events_json,
                prompt_version,
                model,
                input_hash
            ],
        )?;
        if changed == 1 {
            return Ok(InsertResult {
                id: self.conn.last_insert_rowid(),
                inserted: true,
            });
        }
        let id: i64 = self.conn.query_row(
            "SELECT id FROM narrations
             WHERE chapter_id = ?1 AND prompt_version = ?2 AND model = ?3 AND input_hash = ?4",
            params![chapter_id, prompt_version, model, input_hash],
            |row| row.get(0),
        )?;
        Ok(InsertResult {
            id,
            inserted: false,
        })
    }

    /// Book-scoped rebuild indexing only the latest narration per
    /// chapter.
    pub fn rebuild_narrations_fts_for_book(&self, book_id: i64) -> StoreResult<i64> {
        self.conn.execute(
            "DELETE FROM narrations_fts WHERE CAST(book_id AS INTEGER) = ?1",
            [book_id],
        )?;
        self.conn.execute(
            "INSERT INTO narrations_fts (narration_id, book_id, chapter_idx, chapter_title, text)
             SELECT n.id, n.book_id, n.chapter_idx, COALESCE(ch.title, ''), n.narration_text
             FROM narrations n
             JOIN chapters ch ON ch.id = n.chapter_id
             WHERE n.book_id = ?1
               AND n.id = (
                   SELECT n2.id FROM narrations n2 WHERE n2.chapter_id = n.chapter_id
                   ORDER BY n2.created_at DESC, n2.id DESC LIMIT 1
               )",
            [book_id],
        )?;
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM narrations_fts WHERE CAST(book_id AS INTEGER) = ?1",
            [book_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn search_narrations_fts(
        &self,
        book_id: i64,
        query: &str,
        before_chapter_idx: Option<i64>,
        limit: i64,
    ) -> StoreResult<Vec<SearchHitRow>> {
        if limit <= 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let mut stmt = self.conn.prepare(
            "SELECT CAST(narration_id AS INTEGER), CAST(chapter_idx AS INTEGER), chapter_title,
                    text, bm25(narrations_fts)
             FROM narrations_fts
             WHERE narrations_fts MATCH ?1
               AND CAST(book_id AS INTEGER) = ?2
               AND (?3 IS NULL OR CAST(chapter_idx AS INTEGER) < ?3)
             ORDER BY bm25(narrations_fts) ASC
             LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(params![query, book_id, before_chapter_idx, limit], |row| {
                Ok(SearchHitRow {
                    source_type: "narration",
                    source_id: row.get(0)?,
                    chapter_idx: row.get(1)?,
                    chapter_title: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    text: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                    score: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn map_narration(row: &rusqlite::Row<'_>) -> rusqlite::Result<NarrationRow> {
    Ok(NarrationRow {
        id: row.get(0)?,
        book_id: row.get(1)?,
        chapter_id: row.get(2)?,
        chapter_idx: row.get(3)?,
        narration_text: row.get(4)?,
        key_events_json: row.get(5)?,
        prompt_version: row.get(6)?,
        model: row.get(7)?,
        input_hash: row.get(8)?,
        created_at: row.get(9)?,
    })
}
