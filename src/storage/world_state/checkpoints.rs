//! World-state checkpoints, unique per `(book_id, chapter_idx,
//! step_size)`. Append/update-only; restore never deletes them.

use rusqlite::{params, OptionalExtension};

use crate::storage::types::{InsertResult, WorldStateCheckpointRow};
use crate::storage::{Session, StoreResult};

const CHECKPOINT_COLUMNS: &str =
    "id, book_id, chapter_idx, step_size, snapshot_json, snapshot_hash";

impl Session<'_> {
    /// The most recent checkpoint at or before `chapter_idx`,
    /// regardless of the step size it was written under.
    pub fn get_latest_checkpoint_at_or_before(
        &self,
        book_id: i64,
        chapter_idx: i64,
    ) -> StoreResult<Option<WorldStateCheckpointRow>> {
        let sql = format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM world_state_checkpoints
             WHERE book_id = ?1 AND chapter_idx <= ?2
             ORDER BY chapter_idx DESC, created_at DESC, id DESC LIMIT 1"
        );
        let row = self
            .conn
            .query_row(&sql, params![book_id, chapter_idx], map_checkpoint)
            .optional()?;
        Ok(row)
    }

    pub fn get_checkpoint(
        &self,
        book_id: i64,
        chapter_idx: i64,
        step_size: i64,
    ) -> StoreResult<Option<WorldStateCheckpointRow>> {
        let sql = format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM world_state_checkpoints
             WHERE book_id = ?1 AND chapter_idx = ?2 AND step_size = ?3"
        );
        let row = self
            .conn
            .query_row(&sql, params![book_id, chapter_idx, step_size], map_checkpoint)
            .optional()?;
        Ok(row)
    }

    pub fn upsert_world_state_checkpoint(
        &self,
        book_id: i64,
        chapter_idx: i64,
        step_size: i64,
        snapshot_json: &str,
        snapshot_hash: &str,
    ) -> StoreResult<InsertResult> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM world_state_checkpoints
                 WHERE book_id = ?1 AND chapter_idx = ?2 AND step_size = ?3",
                params![book_id, chapter_idx, step_size],
                |row| row.get(0),
            )
            .optional()?;
        self.conn.execute(
            "INSERT INTO world_state_checkpoints
                 (book_id, chapter_idx, step_size, snapshot_json, snapshot_hash)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (book_id, chapter_idx, step_size) DO UPDATE SET
                 snapshot_json = excluded.snapshot_json,
                 snapshot_hash = excluded.snapshot_hash,
                 updated_at = CURRENT_TIMESTAMP",
            params![book_id, chapter_idx, step_size, snapshot_json, snapshot_hash],
        )?;
        let id: i64 = self.conn.query_row(
            "SELECT id FROM world_state_checkpoints
             WHERE book_id = ?1 AND chapter_idx = ?2 AND step_size = ?3",
            params![book_id, chapter_idx, step_size],
            |row| row.get(0),
        )?;
        Ok(InsertResult {
            id,
            inserted: existing.is_none(),
        })
    }
}

fn map_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorldStateCheckpointRow> {
    Ok(WorldStateCheckpointRow {
        id: row.get(0)?,
        book_id: row.get(1)?,
        chapter_idx: row.get(2)?,
        step_size: row.get(3)?,
        snapshot_json: row.get(4)?,
        snapshot_hash: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::storage::Store;

    #[test]
    fn latest_at_or_before_picks_highest_chapter() {
        let store = Store::open_in_memory().unwrap();
        store
            .session(|sess| {
                let book = sess.get_or_create_book(None, None, "bh", "x")?;
                sess.upsert_world_state_checkpoint(book.id, 4, 4, "{}", "h4")?;
                sess.upsert_world_state_checkpoint(book.id, 8, 4, "{}", "h8")?;
                let found = sess.get_latest_checkpoint_at_or_before(book.id, 7)?.unwrap();
                assert_eq!(found.chapter_idx, 4);
                let found = sess.get_latest_checkpoint_at_or_before(book.id, 9)?.unwrap();
                assert_eq!(found.chapter_idx, 8);
                assert!(sess.get_latest_checkpoint_at_or_before(book.id, 3)?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn checkpoint_upsert_updates_in_place() {
        let store = Store::open_in_memory().unwrap();
        store
            .session(|sess| {
                let book = sess.get_or_create_book(None, None, "bh2", "x")?;
                let first = sess.upsert_world_state_checkpoint(book.id, 4, 4, "{}", "h-old")?;
                let second = sess.upsert_world_state_checkpoint(book.id, 4, 4, "{}", "h-new")?;
                assert!(first.inserted);
                assert!(!second.inserted);
                let row = sess.get_checkpoint(book.id, 4, 4)?.unwrap();
                assert_eq!(row.snapshot_hash, "h-new");
                Ok(())
            })
            .unwrap();
    }
}
