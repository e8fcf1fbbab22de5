//! Chunk rows and the chunk FTS index.

use rusqlite::{params, OptionalExtension};

use super::types::{ChunkRow, InsertResult, SearchHitRow};
use super::{Session, StoreResult};

impl Session<'_> {
    /// Idempotent by `chunk_hash`.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_chunk(
        &self,
        chapter_id: i64,
        idx: i64,
        chunk_hash: &str,
        text: &str,
        token_count: i64,
        start_pos: i64,
        end_pos: i64,
        meta_json: Option<&str>,
    ) -> StoreResult<InsertResult> {
        let changed = self.conn.execute(
            "INSERT INTO chunks (chapter_id, idx, chunk_hash, text, token_count, start_pos, end_pos, meta_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (chunk_hash) DO NOTHING",
            params![chapter_id, idx, chunk_hash, text, token_count, start_pos, end_pos, meta_json],
        )?;
        if changed == 1 {
            return Ok(InsertResult {
                id: self.conn.last_insert_rowid(),
                inserted: true,
            });
        }
        let id: i64 = self.conn.query_row(
            "SELECT id FROM chunks WHERE chunk_hash = ?1",
            [chunk_hash],
            |row| row.get(0),
        )?;
        Ok(InsertResult {
            id,
            inserted: false,
        })
    }

    pub fn list_chunks(&self, chapter_id: i64) -> StoreResult<Vec<ChunkRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, idx, text, chunk_hash, token_count FROM chunks
             WHERE chapter_id = ?1 ORDER BY idx",
        )?;
        let rows = stmt
            .query_map([chapter_id], |row| {
                Ok(ChunkRow {
                    id: row.get(0)?,
                    idx: row.get(1)?,
                    text: row.get(2)?,
                    chunk_hash: row.get(3)?,
                    token_count: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Chapter text is the ordered join of its chunks.
    pub fn chapter_text(&self, chapter_id: i64) -> StoreResult<String> {
        let chunks = self.list_chunks(chapter_id)?;
        let mut pieces = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            pieces.push(chunk.text);
        }
        Ok(pieces.join("\n").trim().to_string())
    }

    /// Book-scoped rebuild: drop this book's rows and repopulate from
    /// the chunks table. Returns the indexed row count.
    pub fn rebuild_chunks_fts_for_book(&self, book_id: i64) -> StoreResult<i64> {
        self.conn.execute(
            "DELETE FROM chunks_fts WHERE CAST(book_id AS INTEGER) = ?1",
            [book_id],
        )?;
        self.conn.execute(
            "INSERT INTO chunks_fts (chunk_id, book_id, chapter_idx, chapter_title, text)
             SELECT c.id, ch.book_id, ch.idx, ch.title, c.text
             FROM chunks c
             JOIN chapters ch ON ch.id = c.chapter_id
             WHERE ch.book_id = ?1",
            [book_id],
        )?;
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM chunks_fts WHERE CAST(book_id AS INTEGER) = ?1",
            [book_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn search_chunks_fts(
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
            "SELECT CAST(chunk_id AS INTEGER), CAST(chapter_idx AS INTEGER), chapter_title, text,
                    bm25(chunks_fts)
             FROM chunks_fts
             WHERE chunks_fts MATCH ?1
               AND CAST(book_id AS INTEGER) = ?2
               AND (?3 IS NULL OR CAST(chapter_idx AS INTEGER) < ?3)
             ORDER BY bm25(chunks_fts) ASC
             LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(params![query, book_id, before_chapter_idx, limit], |row| {
                Ok(SearchHitRow {
                    source_type: "chunk",
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

    pub fn find_chunk(&self, chunk_id: i64) -> StoreResult<Option<ChunkRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, idx, text, chunk_hash, token_count FROM chunks WHERE id = ?1",
                [chunk_id],
                |row| {
                    Ok(ChunkRow {
                        id: row.get(0)?,
                        idx: row.get(1)?,
                        text: row.get(2)?,
                        chunk_hash: row.get(3)?,
                        token_count: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::Store;

    fn seed(store: &Store) -> i64 {
        store
            .session(|sess| {
                let book = sess.get_or_create_book(None, None, "bh", "x.txt")?;
                let ch1 = sess.upsert_chapter(book.id, 1, "第一章 山边小村", "c1", 0, 10)?;
                let ch2 = sess.upsert_chapter(book.id, 2, "第二章 青牛镇", "c2", 10, 20)?;
                // unicode61 tokenizes contiguous CJK runs as single
                // tokens, so keep the query term punctuation-separated.
                sess.upsert_chunk(ch1.id, 1, "k1", "韩立，出生在贫苦家庭。", 11, 0, 11, None)?;
                sess.upsert_chunk(ch2.id, 1, "k2", "韩立，前往青牛镇赶集。", 11, 0, 11, None)?;
                Ok(book.id)
            })
            .unwrap()
    }

    #[test]
    fn fts_rebuild_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let book_id = seed(&store);
        let first = store
            .session(|sess| sess.rebuild_chunks_fts_for_book(book_id))
            .unwrap();
        let second = store
            .session(|sess| sess.rebuild_chunks_fts_for_book(book_id))
            .unwrap();
        assert_eq!(first, 2);
        assert_eq!(second, 2);
    }

    #[test]
    fn fts_search_respects_causal_filter() {
        let store = Store::open_in_memory().unwrap();
        let book_id = seed(&store);
        store
            .session(|sess| sess.rebuild_chunks_fts_for_book(book_id))
            .unwrap();
        let hits = store
            .read(|sess| sess.search_chunks_fts(book_id, "\"韩立\"", Some(2), 10))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chapter_idx, 1);
    }

    #[test]
    fn chapter_text_joins_chunks_in_order() {
        let store = Store::open_in_memory().unwrap();
        let chapter_id = store
            .session(|sess| {
                let book = sess.get_or_create_book(None, None, "bh9", "x.txt")?;
                let ch = sess.upsert_chapter(book.id, 1, "t", "c9", 0, 0)?;
                sess.upsert_chunk(ch.id, 2, "k2b", "second", 6, 5, 11, None)?;
                sess.upsert_chunk(ch.id, 1, "k1b", "first", 5, 0, 5, None)?;
                Ok(ch.id)
            })
            .unwrap();
        let text = store.read(|sess| sess.chapter_text(chapter_id)).unwrap();
        assert_eq!(text, "first\nsecond");
    }
}
