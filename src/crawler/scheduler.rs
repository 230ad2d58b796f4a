//! Scheduler for picking the next peer and bounding concurrent sessions
//!
//! This module handles:
//! - Popping waiting identities from the store in FIFO order
//! - Skipping identities already Done this epoch
//! - Applying the reject policy before a peer is ever marked Doing
//! - Global concurrency limiting via a semaphore

use crate::node::{NodeRecord, PeerId, RejectPolicy};
use crate::state::CrawlStatus;
use crate::storage::Store;
use crate::AtlasError;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// What to do with the next waiting identity
#[derive(Debug, Clone)]
pub enum Next {
    /// Launch a session for this peer
    Crawl(NodeRecord),

    /// The reject policy matched; skipped for the rest of the epoch
    Rejected(NodeRecord),

    /// Already Done, or no node record is stored for the identity
    Skipped(PeerId),
}

/// Scheduler hands out waiting peers and session permits
///
/// The permit bounds concurrent sessions globally; each session bounds its
/// own fan-out separately.
pub struct Scheduler {
    /// Global semaphore for limiting concurrent sessions
    semaphore: Arc<Semaphore>,

    capacity: usize,
    store: Arc<Store>,
    reject: Arc<dyn RejectPolicy>,
}

impl Scheduler {
    /// Creates a new scheduler
    ///
    /// # Arguments
    ///
    /// * `threads` - Maximum number of concurrent sessions
    /// * `store` - Store whose waiting queue is drained
    /// * `reject` - Policy consulted before every launch
    pub fn new(threads: usize, store: Arc<Store>, reject: Arc<dyn RejectPolicy>) -> Self {
        let capacity = threads.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            store,
            reject,
        }
    }

    /// Pops the next waiting identity and decides what to do with it
    ///
    /// # Returns
    ///
    /// * `Ok(Some(Next))` - The decision for the popped identity
    /// * `Ok(None)` - No identity is waiting
    /// * `Err(AtlasError)` - The store could not be read
    pub fn next_peer(&self) -> crate::Result<Option<Next>> {
        let Some(id) = self.store.next_waiting() else {
            return Ok(None);
        };

        let Some(node) = self.store.get_node(&id)? else {
            tracing::warn!("Waiting identity {} has no node record", id);
            return Ok(Some(Next::Skipped(id)));
        };

        if self.store.status(&id)? == CrawlStatus::Done {
            return Ok(Some(Next::Skipped(id)));
        }

        if self.reject.rejects(&node.address) {
            tracing::debug!("Rejected {}", node);
            return Ok(Some(Next::Rejected(node)));
        }

        Ok(Some(Next::Crawl(node)))
    }

    /// Waits for a free session slot
    ///
    /// The slot is released when the returned permit is dropped.
    pub async fn acquire(&self) -> crate::Result<OwnedSemaphorePermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| AtlasError::Shutdown)
    }

    /// Number of sessions currently holding a permit
    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
