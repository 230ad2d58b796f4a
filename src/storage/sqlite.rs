//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the KeyValueStore
//! trait. Keys are BLOBs, so SQLite's memcmp ordering gives bytewise order.

use crate::storage::schema::initialize_schema;
use crate::storage::traits::{
    prefix_upper_bound, BatchOp, KeyValueStore, StorageError, StorageResult, WriteBatch,
};
use fs2::FileExt;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// SQLite key/value backend
///
/// A writable database holds an exclusive lock on `<db>.lock` for as long
/// as it is open; a second writer on the same file is refused.
pub struct SqliteKv {
    conn: Connection,
    _lock: Option<File>,
}

impl SqliteKv {
    /// Opens or creates the database at `path`
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file; parent directories are created
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteKv)` - Successfully opened/created database
    /// * `Err(StorageError::Locked)` - Another writer holds the database
    /// * `Err(StorageError)` - Failed to open database
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let lock = acquire_lock(path)?;
        let conn = Connection::open(path)?;

        // Configure SQLite for better performance
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA mmap_size = 268435456;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self {
            conn,
            _lock: Some(lock),
        })
    }

    /// Opens an existing database without taking the writer lock
    ///
    /// Every write through the returned handle fails.
    pub fn open_read_only(path: &Path) -> StorageResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn, _lock: None })
    }

    /// Creates an in-memory database
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self { conn, _lock: None })
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn acquire_lock(path: &Path) -> StorageResult<File> {
    let lock_path = lock_path(path);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)?;
    file.try_lock_exclusive().map_err(|_| StorageError::Locked {
        path: lock_path.display().to_string(),
    })?;
    Ok(file)
}

impl KeyValueStore for SqliteKv {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn contains(&self, key: &[u8]) -> StorageResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> StorageResult<()> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn scan(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let upper = prefix_upper_bound(prefix);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let (sql, lower) = match after {
            Some(after) if after >= prefix => (
                "SELECT key, value FROM kv WHERE key > ?1 AND (?2 IS NULL OR key < ?2)
                 ORDER BY key LIMIT ?3",
                after,
            ),
            _ => (
                "SELECT key, value FROM kv WHERE key >= ?1 AND (?2 IS NULL OR key < ?2)
                 ORDER BY key LIMIT ?3",
                prefix,
            ),
        };

        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params![lower, upper, limit], |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    fn count_prefix(&self, prefix: &[u8]) -> StorageResult<u64> {
        let upper = prefix_upper_bound(prefix);
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM kv WHERE key >= ?1 AND (?2 IS NULL OR key < ?2)",
            params![prefix, upper],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn write(&mut self, batch: WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        {
            let mut put = tx.prepare_cached("INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)")?;
            let mut delete = tx.prepare_cached("DELETE FROM kv WHERE key = ?1")?;
            for op in batch.into_ops() {
                match op {
                    BatchOp::Put(key, value) => {
                        put.execute(params![key, value])?;
                    }
                    BatchOp::Delete(key) => {
                        delete.execute(params![key])?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}
