//! Crawl state store
//!
//! `Store` layers the crawl data model over a `KeyValueStore`: nodes, edges,
//! per-epoch status flags, probe metadata and the counters that mirror the
//! cardinality of each record prefix. Every logical update is a single
//! `WriteBatch`, and counters are bumped inside the same batch as the record
//! they count.
//!
//! The waiting queue is an in-memory mirror of "known but not Done this
//! epoch". It is rebuilt from the persisted flags on open and never treated
//! as authoritative.

use crate::node::{Edge, NodeRecord, PeerId};
use crate::state::{CrawlStatus, MetadataPayload, MetadataRecord, MetadataStatus, ProbeKind};
use crate::storage::schema::{
    decode_counter, encode_counter, CounterKind, Keys, CONFIG_HASH_KEY, EPOCH_KEY,
};
use crate::storage::sqlite::SqliteKv;
use crate::storage::traits::{
    KeyValueStore, PrefixCursor, StorageError, StorageResult, WriteBatch,
};
use chrono::Utc;
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

const SCAN_PAGE_SIZE: usize = 512;

/// Outcome of rebuilding the waiting queue from persisted flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildSummary {
    /// Identities left Doing by an interrupted run, queued first
    pub resumed: usize,

    /// Identities never started this epoch
    pub waiting: usize,

    /// Identities already Done this epoch
    pub done: usize,
}

/// A counter whose stored value disagrees with its prefix cardinality
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterMismatch {
    pub kind: CounterKind,
    pub stored: u64,
    pub actual: u64,
}

/// Durable crawl state shared by the coordinator and all sessions
pub struct Store {
    kv: Mutex<Box<dyn KeyValueStore>>,
    waiting: Mutex<VecDeque<PeerId>>,
    keys: Keys,
    read_only: bool,
}

impl Store {
    /// Opens the store at `path`, resuming the persisted epoch if any
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    /// * `epoch_override` - Epoch to start when none is persisted; defaults to today's date
    ///
    /// # Returns
    ///
    /// * `Ok(Store)` - Store opened and waiting queue rebuilt
    /// * `Err(StorageError)` - Failed to open the database or read its state
    pub fn open(path: &Path, epoch_override: Option<&str>) -> StorageResult<Self> {
        let kv = SqliteKv::open(path)?;
        let store = Self::with_backend(Box::new(kv), epoch_override)?;
        tracing::info!(
            "Opened store at {} (epoch {})",
            path.display(),
            store.epoch()
        );
        Ok(store)
    }

    /// Opens an existing store for statistics and inspection
    ///
    /// Nothing is written: a missing epoch is reported as today's date
    /// without being persisted, counters are computed but not cached, and
    /// the waiting queue is left empty.
    pub fn open_read_only(path: &Path) -> StorageResult<Self> {
        let kv = SqliteKv::open_read_only(path)?;
        let epoch = match read_epoch(&kv)? {
            Some(epoch) => epoch,
            None => today(),
        };

        Ok(Self {
            kv: Mutex::new(Box::new(kv)),
            waiting: Mutex::new(VecDeque::new()),
            keys: Keys::new(epoch),
            read_only: true,
        })
    }

    /// Creates a store backed by an in-memory database
    pub fn in_memory(epoch: &str) -> StorageResult<Self> {
        Self::with_backend(Box::new(SqliteKv::open_in_memory()?), Some(epoch))
    }

    /// Wraps an arbitrary backend, initializing or resuming its epoch
    pub fn with_backend(
        mut kv: Box<dyn KeyValueStore>,
        epoch_override: Option<&str>,
    ) -> StorageResult<Self> {
        let epoch = match read_epoch(&*kv)? {
            Some(persisted) => {
                if let Some(requested) = epoch_override {
                    if requested != persisted {
                        tracing::warn!(
                            "Resuming unfinished epoch {} instead of requested {}",
                            persisted,
                            requested
                        );
                    }
                }
                persisted
            }
            None => {
                let fresh = epoch_override.map(str::to_string).unwrap_or_else(today);
                kv.put(EPOCH_KEY, fresh.as_bytes())?;
                tracing::info!("Starting epoch {}", fresh);
                fresh
            }
        };

        let store = Self {
            kv: Mutex::new(kv),
            waiting: Mutex::new(VecDeque::new()),
            keys: Keys::new(epoch),
            read_only: false,
        };

        let summary = store.rebuild()?;
        tracing::info!(
            "Rebuilt waiting queue: {} resumed, {} waiting, {} done",
            summary.resumed,
            summary.waiting,
            summary.done
        );

        Ok(store)
    }

    /// Epoch all scoped keys are namespaced by
    pub fn epoch(&self) -> &str {
        self.keys.epoch()
    }

    fn kv(&self) -> MutexGuard<'_, Box<dyn KeyValueStore>> {
        self.kv.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn waiting(&self) -> MutexGuard<'_, VecDeque<PeerId>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ===== Nodes =====

    /// Inserts a node on first sighting
    ///
    /// Returns false without touching anything if the identity is already
    /// known. Otherwise the node record and the node counter are written in
    /// one batch and the identity is queued as waiting.
    pub fn put_node(&self, node: &NodeRecord) -> StorageResult<bool> {
        let mut kv = self.kv();
        let key = self.keys.node(&node.id);
        if kv.contains(&key)? {
            return Ok(false);
        }

        let mut batch = WriteBatch::new();
        self.bump(&**kv, &mut batch, &CounterKind::Nodes)?;
        batch.put(key, serde_json::to_vec(node)?);
        kv.write(batch)?;

        self.waiting().push_back(node.id);
        Ok(true)
    }

    pub fn has_node(&self, id: &PeerId) -> StorageResult<bool> {
        self.kv().contains(&self.keys.node(id))
    }

    pub fn get_node(&self, id: &PeerId) -> StorageResult<Option<NodeRecord>> {
        let key = self.keys.node(id);
        let kv = self.kv();
        read_json(&**kv, &key)
    }

    /// Fetches the next page of nodes in identity order
    pub fn next_nodes(
        &self,
        cursor: &mut PrefixCursor,
        limit: usize,
    ) -> StorageResult<Vec<NodeRecord>> {
        let page = cursor.next_page(&**self.kv(), limit)?;
        page.into_iter()
            .map(|(_, value)| serde_json::from_slice(&value).map_err(StorageError::from))
            .collect()
    }

    /// Cursor over all nodes, for use with `next_nodes`
    pub fn nodes_cursor(&self) -> PrefixCursor {
        PrefixCursor::new(self.keys.nodes_prefix())
    }

    // ===== Edges =====

    /// Records that `from` returned `to` in a discovery response this epoch
    ///
    /// The edge and its per-peer, epoch and lifetime counters are written in
    /// one batch. Returns false if the edge already exists this epoch.
    pub fn put_edge(&self, from: &PeerId, to: &PeerId) -> StorageResult<bool> {
        let mut kv = self.kv();
        let key = self.keys.edge(from, to);
        if kv.contains(&key)? {
            return Ok(false);
        }

        let edge = Edge {
            from: *from,
            to: *to,
            epoch: self.epoch().to_string(),
            discovered_at: Utc::now(),
        };

        let mut batch = WriteBatch::new();
        self.bump(&**kv, &mut batch, &CounterKind::PeerEdges(*from))?;
        self.bump(&**kv, &mut batch, &CounterKind::EpochEdges)?;
        self.bump(&**kv, &mut batch, &CounterKind::Edges)?;
        batch.put(key, serde_json::to_vec(&edge)?);
        kv.write(batch)?;

        Ok(true)
    }

    pub fn has_edge(&self, from: &PeerId, to: &PeerId) -> StorageResult<bool> {
        self.kv().contains(&self.keys.edge(from, to))
    }

    /// Returns the targets `from` reported this epoch, in key order
    pub fn edges_from(&self, from: &PeerId) -> StorageResult<Vec<PeerId>> {
        let kv = self.kv();
        let prefix = self.keys.edges_from_prefix(from);
        let mut cursor = PrefixCursor::new(prefix.clone());
        let mut targets = Vec::new();
        while !cursor.is_exhausted() {
            for (key, _) in cursor.next_page(&**kv, SCAN_PAGE_SIZE)? {
                targets.push(peer_from_key(&key, &prefix)?);
            }
        }
        Ok(targets)
    }

    // ===== Crawl status =====

    pub fn status(&self, id: &PeerId) -> StorageResult<CrawlStatus> {
        let kv = self.kv();
        self.status_locked(&**kv, id)
    }

    fn status_locked(&self, kv: &dyn KeyValueStore, id: &PeerId) -> StorageResult<CrawlStatus> {
        if kv.contains(&self.keys.done(id))? {
            Ok(CrawlStatus::Done)
        } else if kv.contains(&self.keys.doing(id))? {
            Ok(CrawlStatus::Doing)
        } else {
            Ok(CrawlStatus::Waiting)
        }
    }

    /// Flags `id` as being crawled this epoch
    ///
    /// Marking an identity that is already Done is an `InvalidTransition`.
    pub fn mark_doing(&self, id: &PeerId) -> StorageResult<()> {
        let mut kv = self.kv();
        let current = self.status_locked(&**kv, id)?;
        if !current.can_transition_to(CrawlStatus::Doing) {
            return Err(StorageError::InvalidTransition {
                peer: id.to_hex(),
                from: current,
                to: CrawlStatus::Doing,
            });
        }

        kv.put(&self.keys.doing(id), Utc::now().to_rfc3339().as_bytes())
    }

    /// Completes `id` for this epoch
    ///
    /// Clears Doing, bumps the epoch Done counter and writes the Done flag in
    /// one batch. Returns false if `id` was already Done: two endpoints can
    /// resolve to the same identity and race to complete it.
    pub fn mark_done(&self, id: &PeerId) -> StorageResult<bool> {
        let mut kv = self.kv();
        let key = self.keys.done(id);
        if kv.contains(&key)? {
            return Ok(false);
        }

        let mut batch = WriteBatch::new();
        batch.delete(self.keys.doing(id));
        self.bump(&**kv, &mut batch, &CounterKind::EpochDone)?;
        batch.put(key, Utc::now().to_rfc3339());
        kv.write(batch)?;

        Ok(true)
    }

    // ===== Metadata =====

    pub fn has_metadata(&self, id: &PeerId, kind: ProbeKind) -> StorageResult<bool> {
        self.kv().contains(&self.keys.metadata(kind, id))
    }

    pub fn get_metadata(
        &self,
        id: &PeerId,
        kind: ProbeKind,
    ) -> StorageResult<Option<MetadataRecord>> {
        let key = self.keys.metadata(kind, id);
        let kv = self.kv();
        read_json(&**kv, &key)
    }

    /// Records the outcome of a probe, first write wins
    ///
    /// A successful record lookup carrying a record that supersedes the
    /// stored node overwrites the node in the same batch; an unknown
    /// identity is inserted and queued as a fresh node.
    pub fn put_metadata(
        &self,
        id: &PeerId,
        kind: ProbeKind,
        status: MetadataStatus,
    ) -> StorageResult<bool> {
        let mut kv = self.kv();
        let key = self.keys.metadata(kind, id);
        if kv.contains(&key)? {
            return Ok(false);
        }

        let record = MetadataRecord::new(*id, kind, status);
        let mut batch = WriteBatch::new();
        let mut queued = None;

        self.bump(&**kv, &mut batch, &CounterKind::Metadata(kind))?;
        let index_key = self.keys.epoch_metadata(kind, id);
        if !kv.contains(&index_key)? {
            self.bump(&**kv, &mut batch, &CounterKind::EpochMetadata(kind))?;
            batch.put(index_key, record.recorded_at.to_rfc3339());
        }

        if let MetadataStatus::Success(MetadataPayload::Record(latest)) = &record.status {
            if latest.id == *id {
                let node_key = self.keys.node(id);
                match read_json::<NodeRecord>(&**kv, &node_key)? {
                    Some(current) if latest.supersedes(&current) => {
                        tracing::debug!(
                            "Record seq {} moves {} from {} to {}",
                            latest.seq,
                            id,
                            current.address,
                            latest.address
                        );
                        batch.put(node_key, serde_json::to_vec(latest)?);
                    }
                    Some(_) => {}
                    None => {
                        self.bump(&**kv, &mut batch, &CounterKind::Nodes)?;
                        batch.put(node_key, serde_json::to_vec(latest)?);
                        queued = Some(*id);
                    }
                }
            }
        }

        batch.put(key, serde_json::to_vec(&record)?);
        kv.write(batch)?;

        if let Some(id) = queued {
            self.waiting().push_back(id);
        }
        Ok(true)
    }

    // ===== Counters =====

    /// Returns the maintained value of `kind`
    ///
    /// An absent counter is computed by scanning its prefix and cached.
    pub fn count(&self, kind: &CounterKind) -> StorageResult<u64> {
        let mut kv = self.kv();
        let key = self.keys.counter(kind);
        match kv.get(&key)? {
            Some(bytes) => decode(&key, &bytes),
            None => {
                let actual = kv.count_prefix(&self.keys.prefix(kind))?;
                if !self.read_only {
                    kv.put(&key, &encode_counter(actual))?;
                }
                Ok(actual)
            }
        }
    }

    /// Recomputes `kind` from its prefix and stores the result
    pub fn rebuild_counter(&self, kind: &CounterKind) -> StorageResult<u64> {
        let mut kv = self.kv();
        let actual = kv.count_prefix(&self.keys.prefix(kind))?;
        kv.put(&self.keys.counter(kind), &encode_counter(actual))?;
        Ok(actual)
    }

    /// Compares every materialized counter with its prefix cardinality
    ///
    /// Absent counters are consistent by definition and are not reported.
    pub fn verify_counters(&self) -> StorageResult<Vec<CounterMismatch>> {
        let kv = self.kv();

        let mut kinds = vec![
            CounterKind::Nodes,
            CounterKind::Edges,
            CounterKind::EpochEdges,
            CounterKind::EpochDone,
        ];
        for kind in ProbeKind::all() {
            kinds.push(CounterKind::Metadata(kind));
            kinds.push(CounterKind::EpochMetadata(kind));
        }

        let peer_prefix = self.keys.peer_edge_counters_prefix();
        let mut cursor = PrefixCursor::new(peer_prefix.clone());
        while !cursor.is_exhausted() {
            for (key, _) in cursor.next_page(&**kv, SCAN_PAGE_SIZE)? {
                kinds.push(CounterKind::PeerEdges(peer_from_key(&key, &peer_prefix)?));
            }
        }

        let mut mismatches = Vec::new();
        for kind in kinds {
            let key = self.keys.counter(&kind);
            if let Some(bytes) = kv.get(&key)? {
                let stored = decode(&key, &bytes)?;
                let actual = kv.count_prefix(&self.keys.prefix(&kind))?;
                if stored != actual {
                    mismatches.push(CounterMismatch {
                        kind,
                        stored,
                        actual,
                    });
                }
            }
        }

        Ok(mismatches)
    }

    /// Adds a +1 of `kind` to `batch`, reading the current value first
    fn bump(
        &self,
        kv: &dyn KeyValueStore,
        batch: &mut WriteBatch,
        kind: &CounterKind,
    ) -> StorageResult<()> {
        let key = self.keys.counter(kind);
        let current = match kv.get(&key)? {
            Some(bytes) => decode(&key, &bytes)?,
            None => kv.count_prefix(&self.keys.prefix(kind))?,
        };
        batch.put(key, encode_counter(current + 1));
        Ok(())
    }

    // ===== Waiting queue =====

    /// Pops the next waiting identity, FIFO
    pub fn next_waiting(&self) -> Option<PeerId> {
        self.waiting().pop_front()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting().len()
    }

    /// Reconstructs the waiting queue from persisted flags
    ///
    /// Identities left Doing by an interrupted run come first, then every
    /// other identity not yet Done, each group in identity order.
    pub fn rebuild(&self) -> StorageResult<RebuildSummary> {
        let kv = self.kv();
        let prefix = self.keys.nodes_prefix();
        let mut cursor = PrefixCursor::new(prefix.clone());

        let mut resumed = Vec::new();
        let mut fresh = Vec::new();
        let mut done = 0;

        while !cursor.is_exhausted() {
            for (key, _) in cursor.next_page(&**kv, SCAN_PAGE_SIZE)? {
                let id = peer_from_key(&key, &prefix)?;
                match self.status_locked(&**kv, &id)? {
                    CrawlStatus::Done => done += 1,
                    CrawlStatus::Doing => resumed.push(id),
                    CrawlStatus::Waiting => fresh.push(id),
                }
            }
        }

        let summary = RebuildSummary {
            resumed: resumed.len(),
            waiting: fresh.len(),
            done,
        };

        let mut waiting = self.waiting();
        waiting.clear();
        waiting.extend(resumed);
        waiting.extend(fresh);

        Ok(summary)
    }

    // ===== Epoch =====

    /// Deletes this epoch's Doing/Done flags, its Done counter and the
    /// persisted epoch marker
    ///
    /// Nodes, edges and metadata are untouched. Returns the number of keys
    /// removed.
    pub fn purge_epoch(&self) -> StorageResult<u64> {
        let mut kv = self.kv();
        let mut batch = WriteBatch::new();

        for prefix in [self.keys.doing_prefix(), self.keys.done_prefix()] {
            let mut cursor = PrefixCursor::new(prefix);
            while !cursor.is_exhausted() {
                for (key, _) in cursor.next_page(&**kv, SCAN_PAGE_SIZE)? {
                    batch.delete(key);
                }
            }
        }

        let done_counter = self.keys.counter(&CounterKind::EpochDone);
        let mut removed = batch.len() as u64;
        if kv.contains(&done_counter)? {
            removed += 1;
        }
        batch.delete(done_counter);
        batch.delete(EPOCH_KEY);
        kv.write(batch)?;

        tracing::info!("Purged {} status keys for epoch {}", removed, self.epoch());
        Ok(removed)
    }

    /// Number of identities currently flagged Doing
    pub fn count_doing(&self) -> StorageResult<u64> {
        self.kv().count_prefix(&self.keys.doing_prefix())
    }

    /// Identities currently Doing, with the edges each has reported this epoch
    pub fn active_peers(&self) -> StorageResult<Vec<(PeerId, u64)>> {
        let mut kv = self.kv();
        let prefix = self.keys.doing_prefix();
        let mut cursor = PrefixCursor::new(prefix.clone());
        let mut ids = Vec::new();
        while !cursor.is_exhausted() {
            for (key, _) in cursor.next_page(&**kv, SCAN_PAGE_SIZE)? {
                ids.push(peer_from_key(&key, &prefix)?);
            }
        }

        let mut active = Vec::with_capacity(ids.len());
        for id in ids {
            let kind = CounterKind::PeerEdges(id);
            let key = self.keys.counter(&kind);
            let edges = match kv.get(&key)? {
                Some(bytes) => decode(&key, &bytes)?,
                None => {
                    let actual = kv.count_prefix(&self.keys.prefix(&kind))?;
                    if !self.read_only {
                        kv.put(&key, &encode_counter(actual))?;
                    }
                    actual
                }
            };
            active.push((id, edges));
        }

        Ok(active)
    }

    /// Stores the hash of the active configuration, returning the previous one
    pub fn record_config_hash(&self, hash: &str) -> StorageResult<Option<String>> {
        let mut kv = self.kv();
        let previous = kv
            .get(CONFIG_HASH_KEY)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
        kv.put(CONFIG_HASH_KEY, hash.as_bytes())?;
        Ok(previous)
    }

    // ===== Raw access =====

    pub fn get_raw(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.kv().get(key)
    }

    pub fn put_raw(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.kv().put(key, value)
    }

    pub fn delete_raw(&self, key: &[u8]) -> StorageResult<()> {
        self.kv().delete(key)
    }
}

fn read_epoch(kv: &dyn KeyValueStore) -> StorageResult<Option<String>> {
    match kv.get(EPOCH_KEY)? {
        Some(bytes) => String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                key: String::from_utf8_lossy(EPOCH_KEY).into_owned(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

fn read_json<T: DeserializeOwned>(kv: &dyn KeyValueStore, key: &[u8]) -> StorageResult<Option<T>> {
    match kv.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn decode(key: &[u8], bytes: &[u8]) -> StorageResult<u64> {
    decode_counter(bytes).ok_or_else(|| StorageError::Corrupt {
        key: String::from_utf8_lossy(key).into_owned(),
        message: format!("expected 8-byte counter, got {} bytes", bytes.len()),
    })
}

fn peer_from_key(key: &[u8], prefix: &[u8]) -> StorageResult<PeerId> {
    Keys::peer_from_key(key, prefix).ok_or_else(|| StorageError::Corrupt {
        key: String::from_utf8_lossy(key).into_owned(),
        message: "key does not end in a peer id".to_string(),
    })
}
