//! Storage traits and error types
//!
//! This module defines the byte-keyed interface every storage backend
//! provides: point reads and writes, ordered prefix scans driven by a
//! caller-owned cursor, and atomic multi-key batches.

use crate::state::CrawlStatus;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid status transition for {peer}: {from} -> {to}")]
    InvalidTransition {
        peer: String,
        from: CrawlStatus,
        to: CrawlStatus,
    },

    #[error("Corrupt value at {key}: {message}")]
    Corrupt { key: String, message: String },

    #[error("Store is locked by another process ({path})")]
    Locked { path: String },
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// A single operation inside a `WriteBatch`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Group of writes applied atomically: all succeed or none do
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put(key.into(), value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete(key.into()));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Trait for byte-keyed storage backends
///
/// Keys are compared bytewise; scans return entries in ascending key order.
/// Implementations are used behind a lock and need not be `Sync`.
pub trait KeyValueStore: Send {
    /// Reads the value stored under `key`
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Returns true if `key` is present
    fn contains(&self, key: &[u8]) -> StorageResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Writes `value` under `key`, replacing any previous value
    fn put(&mut self, key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Removes `key`; removing an absent key is not an error
    fn delete(&mut self, key: &[u8]) -> StorageResult<()>;

    /// Returns up to `limit` entries whose key starts with `prefix`
    ///
    /// When `after` is set only keys strictly greater than it are returned,
    /// which is how `PrefixCursor` pages through a prefix.
    fn scan(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Counts the keys starting with `prefix`
    fn count_prefix(&self, prefix: &[u8]) -> StorageResult<u64>;

    /// Applies all operations of `batch` atomically
    fn write(&mut self, batch: WriteBatch) -> StorageResult<()>;
}

/// Caller-owned position in a prefix scan
///
/// The cursor is a plain value: each caller pages through the prefix with
/// its own cursor, so concurrent scans never share position state.
#[derive(Debug, Clone)]
pub struct PrefixCursor {
    prefix: Vec<u8>,
    after: Option<Vec<u8>>,
    exhausted: bool,
}

impl PrefixCursor {
    pub fn new(prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            prefix: prefix.into(),
            after: None,
            exhausted: false,
        }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Returns true once a page shorter than requested has been returned
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Fetches the next page of at most `limit` entries and advances the cursor
    pub fn next_page(
        &mut self,
        kv: &dyn KeyValueStore,
        limit: usize,
    ) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        if self.exhausted {
            return Ok(Vec::new());
        }

        let page = kv.scan(&self.prefix, self.after.as_deref(), limit)?;
        if page.len() < limit {
            self.exhausted = true;
        }
        if let Some((last, _)) = page.last() {
            self.after = Some(last.clone());
        }

        Ok(page)
    }
}

/// Returns the smallest key greater than every key starting with `prefix`
///
/// Returns None when no such bound exists (empty or all-0xFF prefix), in
/// which case a scan is unbounded above.
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.pop() {
        if last < u8::MAX {
            bound.push(last + 1);
            return Some(bound);
        }
    }
    None
}
