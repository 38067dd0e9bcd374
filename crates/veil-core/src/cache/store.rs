//! Durable backing stores for the cross-session value cache.
//!
//! The cache stores `original PII value → anonymized token` bindings that
//! survive process restarts, so recurring values get a hit from the first
//! request of a new session. Originals are stored verbatim; they are the key.
//!
//! Two implementations are provided:
//!   - [`MemoryStore`]: in-memory only, used in tests and when no cache file
//!     is configured.
//!   - [`SqliteStore`]: an embedded single-table database, used in production.
//!
//! The interface is intentionally minimal. Entries are written one value at a
//! time from background warm-up tasks; reads are per-value lookups from the
//! regex match loop. Batch operations and iteration are not needed.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;

/// Table name for cached sidecar detections.
const CACHE_TABLE: &str = "ollama_cache";

/// The cross-session value cache interface.
///
/// Implementations must be safe for concurrent use. I/O failures are logged
/// and degrade to a miss (`get`) or a dropped write (`set`/`delete`); the
/// detector always has a deterministic fallback token, so cache errors are
/// never fatal to a request.
pub trait CacheStore: Send + Sync {
    /// Returns the cached token for the given original value, if present.
    fn get(&self, original: &str) -> Option<String>;

    /// Stores `original → token`, silently overwriting any existing entry.
    fn set(&self, original: &str, token: &str);

    /// Removes the entry for `original`, if present.
    fn delete(&self, original: &str);

    /// Flushes and releases held resources. Further calls may fail.
    fn close(&self) {}
}

/// Thread-safe in-memory store. Unbounded; pair with the S3-FIFO layer or
/// use only for tests and stateless deployments.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, original: &str) -> Option<String> {
        self.entries.read().get(original).cloned()
    }

    fn set(&self, original: &str, token: &str) {
        self.entries
            .write()
            .insert(original.to_string(), token.to_string());
    }

    fn delete(&self, original: &str) {
        self.entries.write().remove(original);
    }
}

/// Embedded persistent store: one key-value table behind a mutex-guarded
/// connection. For a local single-process proxy this is sufficient and
/// simpler than a pool.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path` and ensures the cache table
    /// exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::setup(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens an in-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::setup(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn setup(conn: &Connection) -> Result<()> {
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {CACHE_TABLE} (
                key   TEXT PRIMARY KEY,
                token TEXT NOT NULL
            );"
        ))?;
        Ok(())
    }

    /// Number of persisted entries, for tests and diagnostics.
    pub fn len(&self) -> usize {
        let conn = self.conn.lock();
        conn.query_row(&format!("SELECT COUNT(*) FROM {CACHE_TABLE}"), [], |row| {
            row.get::<_, i64>(0)
        })
        .unwrap_or(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for SqliteStore {
    fn get(&self, original: &str) -> Option<String> {
        let conn = self.conn.lock();
        match conn
            .query_row(
                &format!("SELECT token FROM {CACHE_TABLE} WHERE key = ?1"),
                [original],
                |row| row.get::<_, String>(0),
            )
            .optional()
        {
            Ok(token) => token,
            Err(e) => {
                tracing::info!("cache store read error: {}", e);
                None
            }
        }
    }

    fn set(&self, original: &str, token: &str) {
        let conn = self.conn.lock();
        if let Err(e) = conn.execute(
            &format!("INSERT OR REPLACE INTO {CACHE_TABLE} (key, token) VALUES (?1, ?2)"),
            [original, token],
        ) {
            tracing::info!("cache store write error: {}", e);
        }
    }

    fn delete(&self, original: &str) {
        let conn = self.conn.lock();
        if let Err(e) = conn.execute(
            &format!("DELETE FROM {CACHE_TABLE} WHERE key = ?1"),
            [original],
        ) {
            tracing::info!("cache store delete error: {}", e);
        }
    }

    fn close(&self) {
        // The connection is closed when the store is dropped; a WAL
        // checkpoint here keeps the on-disk file compact on clean shutdown.
        let conn = self.conn.lock();
        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
            tracing::info!("cache store checkpoint error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("alice@example.com"), None);

        store.set("alice@example.com", "[PII_EMAIL_c160f8cc]");
        assert_eq!(
            store.get("alice@example.com").as_deref(),
            Some("[PII_EMAIL_c160f8cc]")
        );

        store.delete("alice@example.com");
        assert_eq!(store.get("alice@example.com"), None);
    }

    #[test]
    fn sqlite_store_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.get("k"), None);

        store.set("k", "v1");
        assert_eq!(store.get("k").as_deref(), Some("v1"));

        store.set("k", "v2");
        assert_eq!(store.get("k").as_deref(), Some("v2"));
        assert_eq!(store.len(), 1);

        store.delete("k");
        assert_eq!(store.get("k"), None);
        assert!(store.is_empty());
    }

    #[test]
    fn sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.set("alice@example.com", "[PII_EMAIL_c160f8cc]");
            store.close();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(
            store.get("alice@example.com").as_deref(),
            Some("[PII_EMAIL_c160f8cc]")
        );
    }
}
