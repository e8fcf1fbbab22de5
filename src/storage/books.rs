//! Book rows, unique by content hash.

use rusqlite::{params, OptionalExtension};

use super::types::{BookRow, InsertResult};
use super::{Session, StoreError, StoreResult};

impl Session<'_> {
    /// Look up a book by id, or fail with `NotFound`.
    pub fn get_book(&self, book_id: i64) -> StoreResult<BookRow> {
        self.find_book(book_id)?
            .ok_or_else(|| StoreError::NotFound(format!("book id={book_id}")))
    }

    pub fn find_book(&self, book_id: i64) -> StoreResult<Option<BookRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, title, author, book_hash, source_path FROM books WHERE id = ?1",
                [book_id],
                map_book,
            )
            .optional()?;
        Ok(row)
    }

    pub fn find_book_by_hash(&self, book_hash: &str) -> StoreResult<Option<BookRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, title, author, book_hash, source_path FROM books WHERE book_hash = ?1",
                [book_hash],
                map_book,
            )
            .optional()?;
        Ok(row)
    }

    /// Idempotent by `book_hash`: the same normalized text always
    /// maps to the same row.
    pub fn get_or_create_book(
        &self,
        title: Option<&str>,
        author: Option<&str>,
        book_hash: &str,
        source_path: &str,
    ) -> StoreResult<InsertResult> {
        if let Some(existing) = self.find_book_by_hash(book_hash)? {
            return Ok(InsertResult {
                id: existing.id,
                inserted: false,
            });
        }
        self.conn.execute(
            "INSERT INTO books (title, author, book_hash, source_path) VALUES (?1, ?2, ?3, ?4)",
            params![title, author, book_hash, source_path],
        )?;
        Ok(InsertResult {
            id: self.conn.last_insert_rowid(),
            inserted: true,
        })
    }
}

fn map_book(row: &rusqlite::Row<'_>) -> rusqlite::Result<BookRow> {
    Ok(BookRow {
        id: row.get(0)?,
        title: row.get(1)?,
        author: row.get(2)?,
        book_hash: row.get(3)?,
        source_path: row.get(4)?,
    })
}
