//! Content-addressed LLM response cache.
//!
//! A thread-safe KV keyed by `make_cache_key(parts…)`. Values are raw
//! response strings. TTL is enforced on read: a stale row is deleted
//! and reported as a miss. Entries that fail to parse as the caller's
//! schema are deleted by the LLM client so a corrupt payload is never
//! served twice. `get`/`set`/`delete` are atomic with respect to each
//! other (single connection behind a lock; the memory backend is a
//! concurrent map).

use std::path::Path;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::config::CacheSection;

#[derive(Debug, Clone)]
pub struct CacheResult {
    pub value: Option<String>,
    pub hit: bool,
}

impl CacheResult {
    fn miss() -> Self {
        Self {
            value: None,
            hit: false,
        }
    }
}

struct MemoryEntry {
    value: String,
    created_at: i64,
}

enum Backend {
    Sqlite(Mutex<Connection>),
    Memory(DashMap<String, MemoryEntry>),
    Disabled,
}

pub struct LlmCache {
    ttl_seconds: i64,
    backend: Backend,
}

impl LlmCache {
    /// Open the configured backend under `data_dir`. Unknown backends
    /// degrade to disabled with a warning.
    pub fn open(section: &CacheSection, data_dir: &Path) -> Self {
        if !section.enabled {
            return Self::disabled();
        }
        match section.backend.as_str() {
            "sqlite" => match open_sqlite(data_dir) {
                Ok(conn) => Self {
                    ttl_seconds: section.ttl_seconds,
                    backend: Backend::Sqlite(Mutex::new(conn)),
                },
                Err(err) => {
                    log::warn!("LLM cache disabled, sqlite backend failed to open: {err}");
                    Self::disabled()
                }
            },
            "memory" => Self::memory(section.ttl_seconds),
            other => {
                log::warn!("LLM cache disabled, unknown backend '{other}'");
                Self::disabled()
            }
        }
    }

    pub fn disabled() -> Self {
        Self {
            ttl_seconds: 0,
            backend: Backend::Disabled,
        }
    }

    pub fn memory(ttl_seconds: i64) -> Self {
        Self {
            ttl_seconds,
            backend: Backend::Memory(DashMap::new()),
        }
    }

    fn expired(&self, created_at: i64) -> bool {
        self.ttl_seconds > 0 && Utc::now().timestamp() - created_at > self.ttl_seconds
    }

    pub fn get(&self, key: &str) -> CacheResult {
        match &self.backend {
            Backend::Disabled => CacheResult::miss(),
            Backend::Memory(map) => {
                let expired = match map.get(key) {
                    None => return CacheResult::miss(),
                    Some(entry) if self.expired(entry.created_at) => true,
                    Some(entry) => {
                        return CacheResult {
                            value: Some(entry.value.clone()),
                            hit: true,
                        }
                    }
                };
                if expired {
                    map.remove(key);
                }
                CacheResult::miss()
            }
            Backend::Sqlite(conn) => {
                let conn = conn.lock();
                let row: Option<(String, i64)> = conn
                    .query_row(
                        "SELECT value, created_at FROM llm_cache WHERE key = ?1",
                        [key],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()
                    .unwrap_or_else(|err| {
                        log::warn!("LLM cache read failed key={}: {err}", &key[..key.len().min(12)]);
                        None
                    });
                match row {
                    None => CacheResult::miss(),
                    Some((_, created_at)) if self.expired(created_at) => {
                        let _ = conn.execute("DELETE FROM llm_cache WHERE key = ?1", [key]);
                        CacheResult::miss()
                    }
                    Some((value, _)) => CacheResult {
                        value: Some(value),
                        hit: true,
                    },
                }
            }
        }
    }

    pub fn set(&self, key: &str, value: &str) {
        match &self.backend {
            Backend::Disabled => {}
            Backend::Memory(map) => {
                map.insert(
                    key.to_string(),
                    MemoryEntry {
                        value: value.to_string(),
                        created_at: Utc::now().timestamp(),
                    },
                );
            }
            Backend::Sqlite(conn) => {
                let conn = conn.lock();
                if let Err(err) = conn.execute(
                    "INSERT OR REPLACE INTO llm_cache (key, value, created_at) VALUES (?1, ?2, ?3)",
                    params![key, value, Utc::now().timestamp()],
                ) {
                    log::warn!("LLM cache write failed key={}: {err}", &key[..key.len().min(12)]);
                }
            }
        }
    }

    pub fn delete(&self, key: &str) {
        match &self.backend {
            Backend::Disabled => {}
            Backend::Memory(map) => {
                map.remove(key);
            }
            Backend::Sqlite(conn) => {
                let conn = conn.lock();
                let _ = conn.execute("DELETE FROM llm_cache WHERE key = ?1", [key]);
            }
        }
    }
}

fn open_sqlite(data_dir: &Path) -> Result<Connection, rusqlite::Error> {
    if let Err(err) = std::fs::create_dir_all(data_dir) {
        log::warn!("cache dir create failed {}: {err}", data_dir.display());
    }
    let conn = Connection::open(data_dir.join("cache.sqlite"))?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS llm_cache (
             key TEXT PRIMARY KEY,
             value TEXT NOT NULL,
             created_at INTEGER NOT NULL
         );",
    )?;
    Ok(conn)
}
