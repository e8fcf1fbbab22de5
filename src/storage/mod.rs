//! Persistent relational store.
//!
//! One SQLite database holds books, chapters, chunks, narrations,
//! narration outputs, legacy summaries, the world-state tables, and
//! the two FTS5 virtual indexes. All access goes through a [`Store`]:
//! `read` for lock-scoped queries, `session` for a transaction that
//! commits on success and rolls back on error. A session is the unit
//! of write atomicity — one per chapter or step.

pub mod books;
pub mod chapters;
pub mod chunks;
pub mod narration_outputs;
pub mod narrations;
pub mod summaries;
pub mod types;
pub mod world_state;

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::Connection;

pub use types::{
    BookRow, ChapterRow, ChunkRow, InsertResult, ItemRow, NarrationOutputRow, NarrationRow,
    PlotEventRow, SearchHitRow, SummaryRow, WorldFactRow, WorldStateCheckpointRow,
};
pub use world_state::{CharacterUpsert, ItemUpsert, WorldStateSnapshot};
pub use types::CharacterRow;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("row serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Process-wide handle to the relational database.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating directories and schema as needed).
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run queries under the connection lock, outside a transaction.
    pub fn read<T>(&self, f: impl FnOnce(&Session<'_>) -> StoreResult<T>) -> StoreResult<T> {
        let guard = self.conn.lock();
        f(&Session { conn: &guard })
    }

    /// Run a write unit in a transaction: commit on `Ok`, roll back
    /// on `Err`.
    pub fn session<T>(&self, f: impl FnOnce(&Session<'_>) -> StoreResult<T>) -> StoreResult<T> {
        let mut guard = self.conn.lock();
        let tx = guard.transaction()?;
        match f(&Session { conn: &tx }) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                // Dropping the transaction rolls it back.
                drop(tx);
                Err(err)
            }
        }
    }
}

/// A borrowed view of the connection, transactional or not. Every
/// CRUD operation lives here so callers cannot bypass the scope.
pub struct Session<'c> {
    pub(crate) conn: &'c Connection,
}

fn init_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS books (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT,
            author TEXT,
            book_hash TEXT NOT NULL UNIQUE,
            source_path TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS chapters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            book_id INTEGER NOT NULL REFERENCES books(id) ON DELETE CASCADE,
            idx INTEGER NOT NULL,
            title TEXT NOT NULL,
            chapter_hash TEXT NOT NULL UNIQUE,
            start_pos INTEGER NOT NULL DEFAULT 0,
            end_pos INTEGER NOT NULL DEFAULT 0,
            UNIQUE (book_id, idx)
        );
        CREATE INDEX IF NOT EXISTS idx_chapters_book_id ON chapters(book_id);

        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            chapter_id INTEGER NOT NULL REFERENCES chapters(id) ON DELETE CASCADE,
            idx INTEGER NOT NULL,
            chunk_hash TEXT NOT NULL UNIQUE,
            text TEXT NOT NULL,
            token_count INTEGER NOT NULL DEFAULT 0,
            start_pos INTEGER NOT NULL DEFAULT 0,
            end_pos INTEGER NOT NULL DEFAULT 0,
            meta_json TEXT,
            UNIQUE (chapter_id, idx)
        );
        CREATE INDEX IF NOT EXISTS idx_chunks_chapter_id ON chunks(chapter_id);

        CREATE TABLE IF NOT EXISTS narrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            book_id INTEGER NOT NULL REFERENCES books(id) ON DELETE CASCADE,
            chapter_id INTEGER NOT NULL REFERENCES chapters(id) ON DELETE CASCADE,
            chapter_idx INTEGER NOT NULL,
            narration_text TEXT NOT NULL,
            key_events_json TEXT,
            prompt_version TEXT NOT NULL,
            model TEXT NOT NULL,
            input_hash TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (chapter_id, prompt_version, model, input_hash)
        );
        CREATE INDEX IF NOT EXISTS idx_narrations_book_id ON narrations(book_id);
        CREATE INDEX IF NOT EXISTS idx_narrations_chapter_id ON narrations(chapter_id);

        CREATE TABLE IF NOT EXISTS narration_outputs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            narration_id INTEGER NOT NULL UNIQUE REFERENCES narrations(id) ON DELETE CASCADE,
            book_id INTEGER NOT NULL REFERENCES books(id) ON DELETE CASCADE,
            chapter_id INTEGER NOT NULL,
            chapter_idx INTEGER NOT NULL,
            prompt_version TEXT NOT NULL,
            model TEXT NOT NULL,
            input_hash TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        CREATE INDEX IF NOT EXISTS idx_narration_outputs_chapter ON narration_outputs(chapter_id);

        CREATE TABLE IF NOT EXISTS summaries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            scope TEXT NOT NULL,
            ref_id INTEGER NOT NULL,
            summary_type TEXT NOT NULL,
            prompt_version TEXT NOT NULL,
            model TEXT NOT NULL,
            input_hash TEXT NOT NULL,
            content TEXT NOT NULL,
            params_json TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (scope, ref_id, summary_type, prompt_version, model, input_hash)
        );
        CREATE INDEX IF NOT EXISTS idx_summaries_ref ON summaries(scope, ref_id, summary_type);

        CREATE TABLE IF NOT EXISTS characters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            book_id INTEGER NOT NULL REFERENCES books(id) ON DELETE CASCADE,
            canonical_name TEXT NOT NULL,
            aliases_json TEXT NOT NULL DEFAULT '[]',
            first_chapter_idx INTEGER,
            last_chapter_idx INTEGER,
            status TEXT NOT NULL DEFAULT 'active',
            location TEXT,
            abilities_json TEXT,
            relationships_json TEXT,
            motivation TEXT,
            notes TEXT,
            UNIQUE (book_id, canonical_name)
        );
        CREATE INDEX IF NOT EXISTS idx_characters_book_id ON characters(book_id);

        CREATE TABLE IF NOT EXISTS items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            book_id INTEGER NOT NULL REFERENCES books(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            owner_name TEXT,
            first_chapter_idx INTEGER,
            last_chapter_idx INTEGER,
            description TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            UNIQUE (book_id, name)
        );
        CREATE INDEX IF NOT EXISTS idx_items_book_id ON items(book_id);

        CREATE TABLE IF NOT EXISTS plot_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            book_id INTEGER NOT NULL REFERENCES books(id) ON DELETE CASCADE,
            chapter_idx INTEGER NOT NULL,
            event_summary TEXT NOT NULL,
            involved_characters_json TEXT,
            event_type TEXT,
            impact TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        CREATE INDEX IF NOT EXISTS idx_plot_events_book_chapter ON plot_events(book_id, chapter_idx);

        CREATE TABLE IF NOT EXISTS world_facts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            book_id INTEGER NOT NULL REFERENCES books(id) ON DELETE CASCADE,
            fact_key TEXT NOT NULL,
            fact_value TEXT NOT NULL,
            confidence REAL NOT NULL DEFAULT 0.8,
            source_chapter_idx INTEGER,
            source_excerpt TEXT,
            UNIQUE (book_id, fact_key)
        );
        CREATE INDEX IF NOT EXISTS idx_world_facts_book_id ON world_facts(book_id);

        CREATE TABLE IF NOT EXISTS world_state_checkpoints (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            book_id INTEGER NOT NULL REFERENCES books(id) ON DELETE CASCADE,
            chapter_idx INTEGER NOT NULL,
            step_size INTEGER NOT NULL,
            snapshot_json TEXT NOT NULL,
            snapshot_hash TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (book_id, chapter_idx, step_size)
        );
        CREATE INDEX IF NOT EXISTS idx_checkpoints_book_chapter
            ON world_state_checkpoints(book_id, chapter_idx);

        CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
            chunk_id UNINDEXED, book_id UNINDEXED, chapter_idx UNINDEXED, chapter_title, text
        );
        CREATE VIRTUAL TABLE IF NOT EXISTS narrations_fts USING fts5(
            narration_id UNINDEXED, book_id UNINDEXED, chapter_idx UNINDEXED, chapter_title, text
        );
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_initializes_twice_without_error() {
        let store = Store::open_in_memory().unwrap();
        store
            .read(|sess| {
                init_schema(sess.conn)?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn session_rolls_back_on_error() {
        let store = Store::open_in_memory().unwrap();
        let result: StoreResult<()> = store.session(|sess| {
            sess.get_or_create_book(Some("t"), None, "hash-x", "path")?;
            Err(StoreError::Integrity("forced".into()))
        });
        assert!(result.is_err());

        let book = store
            .read(|sess| sess.find_book_by_hash("hash-x"))
            .unwrap();
        assert!(book.is_none());
    }

    #[test]
    fn session_commits_on_success() {
        let store = Store::open_in_memory().unwrap();
        store
            .session(|sess| sess.get_or_create_book(Some("t"), None, "hash-y", "path"))
            .unwrap();
        let book = store
            .read(|sess| sess.find_book_by_hash("hash-y"))
            .unwrap();
        assert!(book.is_some());
    }

    #[test]
    fn cascade_delete_removes_per_book_rows() {
        let store = Store::open_in_memory().unwrap();
        let book_id = store
            .session(|sess| {
                let book = sess.get_or_create_book(Some("t"), None, "hash-z", "path")?;
                let chapter =
                    sess.upsert_chapter(book.id, 1, "第1章", "ch-hash", 0, 10)?;
                sess.upsert_chunk(chapter.id, 1, "chunk-hash", "text", 4, 0, 4, None)?;
                sess.insert_plot_event(book.id, 1, "event", None, None, None)?;
                Ok(book.id)
            })
            .unwrap();

        store
            .session(|sess| {
                sess.conn
                    .execute("DELETE FROM books WHERE id = ?1", [book_id])?;
                Ok(())
            })
            .unwrap();

        let (chapters, events) = store
            .read(|sess| {
                let chapters: i64 = sess.conn.query_row(
                    "SELECT COUNT(*) FROM chapters WHERE book_id = ?1",
                    [book_id],
                    |row| row.get(0),
                )?;
                let events: i64 = sess.conn.query_row(
                    "SELECT COUNT(*) FROM plot_events WHERE book_id = ?1",
                    [book_id],
                    |row| row.get(0),
                )?;
                Ok((chapters, events))
            })
            .unwrap();
        assert_eq!(chapters, 0);
        assert_eq!(events, 0);
    }
}
