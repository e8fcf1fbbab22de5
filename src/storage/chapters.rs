//! Chapter rows: contiguous 1-based `idx` within a book, identity by
//! `chapter_hash`.

use rusqlite::{params, OptionalExtension};

use super::types::{ChapterRow, InsertResult};
use super::{Session, StoreResult};

impl Session<'_> {
    pub fn list_chapters(&self, book_id: i64) -> StoreResult<Vec<ChapterRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, book_id, idx, title, chapter_hash, start_pos, end_pos
             FROM chapters WHERE book_id = ?1 ORDER BY idx",
        )?;
        let rows = stmt
            .query_map([book_id], map_chapter)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn find_chapter_by_idx(&self, book_id: i64, idx: i64) -> StoreResult<Option<ChapterRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, book_id, idx, title, chapter_hash, start_pos, end_pos
                 FROM chapters WHERE book_id = ?1 AND idx = ?2",
                params![book_id, idx],
                map_chapter,
            )
            .optional()?;
        Ok(row)
    }

    /// Upsert keyed by `(book_id, idx)`. An unchanged `chapter_hash`
    /// reports `inserted = false`, so re-ingesting the same file
    /// creates zero new chapters.
    pub fn upsert_chapter(
        &self,
        book_id: i64,
        idx: i64,
        title: &str,
        chapter_hash: &str,
        start_pos: i64,
        end_pos: i64,
    ) -> StoreResult<InsertResult> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM chapters WHERE chapter_hash = ?1",
                [chapter_hash],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            self.conn.execute(
                "UPDATE chapters SET start_pos = ?2, end_pos = ?3 WHERE id = ?1",
                params![id, start_pos, end_pos],
            )?;
            return Ok(InsertResult {
                id,
                inserted: false,
            });
        }

        self.conn.execute(
            "INSERT INTO chapters (book_id, idx, title, chapter_hash, start_pos, end_pos)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (book_id, idx) DO UPDATE SET
                 title = excluded.title,
                 chapter_hash = excluded.chapter_hash,
                 start_pos = excluded.start_pos,
                 end_pos = excluded.end_pos",
            params![book_id, idx, title, chapter_hash, start_pos, end_pos],
        )?;
        let id: i64 = self.conn.query_row(
            "SELECT id FROM chapters WHERE book_id = ?1 AND idx = ?2",
            params![book_id, idx],
            |row| row.get(0),
        )?;
        Ok(InsertResult { id, inserted: true })
    }

    pub fn max_chapter_idx(&self, book_id: i64) -> StoreResult<i64> {
        let max: Option<i64> = self.conn.query_row(
            "SELECT MAX(idx) FROM chapters WHERE book_id = ?1",
            [book_id],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0))
    }
}

fn map_chapter(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChapterRow> {
    Ok(ChapterRow {
        id: row.get(0)?,
        book_id: row.get(1)?,
        idx: row.get(2)?,
        title: row.get(3)?,
        chapter_hash: row.get(4)?,
        start_pos: row.get(5)?,
        end_pos: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::storage::Store;

    #[test]
    fn chapter_idx_stays_contiguous_after_reingest() {
        let store = Store::open_in_memory().unwrap();
        store
            .session(|sess| {
                let book = sess.get_or_create_book(None, None, "bh", "x.txt")?;
                for idx in 1..=3 {
                    sess.upsert_chapter(book.id, idx, &format!("第{idx}章"), &format!("h{idx}"), 0, 0)?;
                }
                // Same hashes again: nothing new.
                for idx in 1..=3 {
                    let result =
                        sess.upsert_chapter(book.id, idx, &format!("第{idx}章"), &format!("h{idx}"), 0, 0)?;
                    assert!(!result.inserted);
                }
                let chapters = sess.list_chapters(book.id)?;
                let indexes: Vec<i64> = chapters.iter().map(|c| c.idx).collect();
                assert_eq!(indexes, vec![1, 2, 3]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn changed_text_replaces_the_row_at_same_idx() {
        let store = Store::open_in_memory().unwrap();
        store
            .session(|sess| {
                let book = sess.get_or_create_book(None, None, "bh2", "x.txt")?;
                sess.upsert_chapter(book.id, 1, "第1章", "old-hash", 0, 5)?;
                let result = sess.upsert_chapter(book.id, 1, "第1章", "new-hash", 0, 9)?;
                assert!(result.inserted);
                let chapters = sess.list_chapters(book.id)?;
                assert_eq!(chapters.len(), 1);
                assert_eq!(chapters[0].chapter_hash, "new-hash");
                Ok(())
            })
            .unwrap();
    }
}
