//! SQLite implementation of the KvStore trait.
//!
//! This is the persistent backend for archived envelopes. It uses rusqlite
//! with bundled SQLite, wrapped in async via `tokio::task::spawn_blocking`.
//! Keys are BLOBs in a `WITHOUT ROWID` table; SQLite compares BLOBs with
//! `memcmp`, so its index order is exactly the byte order the keys need.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{Entry, KeyRange, KvStore};

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::TaskFailed(e.to_string()))?
    }
}

/// SQLite takes `LIMIT` as a signed integer.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let key = key.to_vec();
        let value = value.to_vec();
        self.run(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO envelopes (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let key = key.to_vec();
        self.run(move |conn| {
            let value: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT value FROM envelopes WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value.map(Bytes::from))
        })
        .await
    }

    async fn delete(&self, key: &[u8]) -> Result<bool> {
        let key = key.to_vec();
        self.run(move |conn| {
            let n = conn.execute("DELETE FROM envelopes WHERE key = ?1", params![key])?;
            Ok(n > 0)
        })
        .await
    }

    async fn scan(&self, range: &KeyRange, limit: usize) -> Result<Vec<Entry>> {
        let range = range.clone();
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT key, value FROM envelopes
                 WHERE key >= ?1 AND key < ?2
                 ORDER BY key ASC LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![range.start, range.end, sql_limit(limit)],
                |row| {
                    let key: Vec<u8> = row.get(0)?;
                    let value: Vec<u8> = row.get(1)?;
                    Ok(Entry {
                        key,
                        value: Bytes::from(value),
                    })
                },
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(StoreError::from)
        })
        .await
    }

    async fn scan_keys(&self, range: &KeyRange, limit: usize) -> Result<Vec<Vec<u8>>> {
        let range = range.clone();
        self.run(move |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT key FROM envelopes
                 WHERE key >= ?1 AND key < ?2
                 ORDER BY key ASC LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![range.start, range.end, sql_limit(limit)],
                |row| row.get::<_, Vec<u8>>(0),
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(StoreError::from)
        })
        .await
    }

    async fn count(&self, range: &KeyRange) -> Result<u64> {
        let range = range.clone();
        self.run(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM envelopes WHERE key >= ?1 AND key < ?2",
                params![range.start, range.end],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
        .await
    }

    async fn delete_range(&self, range: &KeyRange, limit: usize) -> Result<u64> {
        let range = range.clone();
        self.run(move |conn| {
            let n = conn.execute(
                "DELETE FROM envelopes WHERE key IN (
                    SELECT key FROM envelopes
                    WHERE key >= ?1 AND key < ?2
                    ORDER BY key ASC LIMIT ?3
                 )",
                params![range.start, range.end, sql_limit(limit)],
            )?;
            Ok(n as u64)
        })
        .await
    }

    async fn len(&self) -> Result<u64> {
        self.run(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM envelopes", [], |row| row.get(0))?;
            Ok(n as u64)
        })
        .await
    }
}
