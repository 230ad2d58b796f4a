//! Storage module for persisting crawl state
//!
//! This module handles all durable state for the crawler:
//! - A byte-keyed, ordered key/value primitive (`KeyValueStore`) with a SQLite backend
//! - The key layout for nodes, edges, status flags, metadata and counters
//! - `Store`, the crash-consistent crawl state built on top of it

mod schema;
mod sqlite;
mod store;
mod traits;

pub use schema::{CounterKind, Keys};
pub use sqlite::SqliteKv;
pub use store::{CounterMismatch, RebuildSummary, Store};
pub use traits::{
    prefix_upper_bound, BatchOp, KeyValueStore, PrefixCursor, StorageError, StorageResult,
    WriteBatch,
};

use std::path::Path;

/// Opens the crawl store at `path`
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
/// * `epoch` - Epoch to start if the database has no unfinished epoch
///
/// # Returns
///
/// * `Ok(Store)` - Successfully opened store with its waiting queue rebuilt
/// * `Err(StorageError)` - Failed to open or read the database
pub fn open_storage(path: &Path, epoch: Option<&str>) -> StorageResult<Store> {
    Store::open(path, epoch)
}
