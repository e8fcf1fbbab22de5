//! Append-only per-book vector tables.
//!
//! One SQLite file under `storage.vector_dir` holds
//! `chunks_vectors_<book_id>` and `narrations_vectors_<book_id>`
//! tables. Insertion is idempotent by source id (chunk id or
//! narration id), so incremental embedding only pays for new rows.
//! Queries are brute-force cosine over the stored vectors — fine at
//! per-book scale and fully deterministic.

use std::collections::HashSet;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection};

#[derive(Debug, thiserror::Error)]
pub enum VectorStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dimension mismatch: stored={stored} query={query}")]
    DimensionMismatch { stored: usize, query: usize },
}

pub type VectorResult<T> = Result<T, VectorStoreError>;

/// Which per-book table family a call addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorTableKind {
    Chunks,
    Narrations,
}

impl VectorTableKind {
    pub fn table_name(&self, book_id: i64) -> String {
        match self {
            VectorTableKind::Chunks => format!("chunks_vectors_{book_id}"),
            VectorTableKind::Narrations => format!("narrations_vectors_{book_id}"),
        }
    }
}

/// A row to append: the source id is the primary key.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub source_id: i64,
    pub chapter_idx: i64,
    pub chapter_title: String,
    pub text: String,
    pub vector: Vec<f32>,
}

/// A k-NN candidate with its metadata and cosine similarity.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub source_id: i64,
    pub chapter_idx: i64,
    pub chapter_title: String,
    pub text: String,
    pub similarity: f64,
}

pub struct VectorStore {
    conn: Mutex<Connection>,
}

impl VectorStore {
    pub fn open(dir: &Path) -> VectorResult<Self> {
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join("vectors.sqlite"))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> VectorResult<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    fn ensure_table(conn: &Connection, table: &str) -> VectorResult<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                 source_id INTEGER PRIMARY KEY,
                 chapter_idx INTEGER NOT NULL,
                 chapter_title TEXT NOT NULL DEFAULT '',
                 text TEXT NOT NULL DEFAULT '',
                 embedding BLOB NOT NULL
             );"
        ))?;
        Ok(())
    }

    /// Ids already present, so callers can embed only the new rows.
    pub fn list_existing_ids(
        &self,
        book_id: i64,
        kind: VectorTableKind,
    ) -> VectorResult<HashSet<i64>> {
        let table = kind.table_name(book_id);
        let conn = self.conn.lock();
        Self::ensure_table(&conn, &table)?;
        let mut stmt = conn.prepare(&format!("SELECT source_id FROM {table}"))?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(ids)
    }

    /// Append records; rows whose source id already exists are left
    /// untouched. Returns the number actually inserted.
    pub fn append(
        &self,
        book_id: i64,
        kind: VectorTableKind,
        records: &[VectorRecord],
    ) -> VectorResult<usize> {
        let table = kind.table_name(book_id);
        let conn = self.conn.lock();
        Self::ensure_table(&conn, &table)?;
        let mut inserted = 0;
        let sql = format!(
            "INSERT OR IGNORE INTO {table}
                 (source_id, chapter_idx, chapter_title, text, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5)"
        );
        let mut stmt = conn.prepare(&sql)?;
        for record in records {
            let blob = vector_to_bytes(&record.vector);
            inserted += stmt.execute(params![
                record.source_id,
                record.chapter_idx,
                record.chapter_title,
                record.text,
                blob
            ])?;
        }
        Ok(inserted)
    }

    /// Top-k by cosine similarity, best first.
    pub fn query(
        &self,
        book_id: i64,
        kind: VectorTableKind,
        query_vector: &[f32],
        k: usize,
    ) -> VectorResult<Vec<VectorHit>> {
        if k == 0 || query_vector.is_empty() {
            return Ok(Vec::new());
        }
        let table = kind.table_name(book_id);
        let conn = self.conn.lock();
        Self::ensure_table(&conn, &table)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT source_id, chapter_idx, chapter_title, text, embedding FROM {table}"
        ))?;
        let mut hits: Vec<VectorHit> = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let blob: Vec<u8> = row.get(4)?;
            let stored = bytes_to_vector(&blob);
            if stored.len() != query_vector.len() {
                return Err(VectorStoreError::DimensionMismatch {
                    stored: stored.len(),
                    query: query_vector.len(),
                });
            }
            hits.push(VectorHit {
                source_id: row.get(0)?,
                chapter_idx: row.get(1)?,
                chapter_title: row.get(2)?,
                text: row.get(3)?,
                similarity: cosine_similarity(query_vector, &stored),
            });
        }

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    pub fn count(&self, book_id: i64, kind: VectorTableKind) -> VectorResult<i64> {
        let table = kind.table_name(book_id);
        let conn = self.conn.lock();
        Self::ensure_table(&conn, &table)?;
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(count)
    }
}

fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn bytes_to_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
