//! Network query primitives
//!
//! The crawler talks to the network only through the `Querier` trait: one
//! discovery call, one record lookup and one handshake probe. The wire
//! protocol behind it is owned elsewhere; this crate ships an in-memory
//! `SimulatedNetwork` implementation.

mod sim;

pub use sim::{SimulatedNetwork, Topology, TopologyPeer};

use crate::node::NodeRecord;
use crate::state::ClientInfo;
use async_trait::async_trait;
use std::io;
use thiserror::Error;

/// Errors returned by a single network query
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query timed out")]
    Timeout,

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// How the crawler reacts to a query error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts and refusals; absorbed by the session
    NetworkTransient,

    /// Undecodable or inconsistent responses; handled like transient errors
    ProtocolMalformed,

    /// The local process is starved of descriptors or memory; fatal
    ResourceExhaustion,
}

const EMFILE: i32 = 24;
const ENFILE: i32 = 23;

impl QueryError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout | Self::Refused(_) => ErrorClass::NetworkTransient,
            Self::Malformed(_) => ErrorClass::ProtocolMalformed,
            Self::ResourceExhausted(_) => ErrorClass::ResourceExhaustion,
            Self::Io(e) => {
                if e.kind() == io::ErrorKind::OutOfMemory
                    || matches!(e.raw_os_error(), Some(EMFILE) | Some(ENFILE))
                {
                    ErrorClass::ResourceExhaustion
                } else {
                    ErrorClass::NetworkTransient
                }
            }
        }
    }

    /// Returns true if the error signals systemic starvation rather than a
    /// fault of the queried peer
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::ResourceExhaustion
    }

    /// Short form stored in failed metadata records
    pub fn summary(&self) -> String {
        let text = self.to_string();
        match text.char_indices().nth(120) {
            Some((cut, _)) => format!("{}...", &text[..cut]),
            None => text,
        }
    }
}

/// Network primitives used by crawl sessions
///
/// Implementations must be safe to call concurrently for the same target;
/// a session issues several discovery calls at once.
#[async_trait]
pub trait Querier: Send + Sync {
    /// Asks `target` for peers it knows
    ///
    /// A single call may return only a bounded, randomized subset of the
    /// target's table, so the crawler calls it repeatedly.
    async fn find_related_peers(&self, target: &NodeRecord) -> Result<Vec<NodeRecord>, QueryError>;

    /// Fetches the latest signed record of `target`
    async fn request_record(&self, target: &NodeRecord) -> Result<NodeRecord, QueryError>;

    /// Opens a direct connection to `target` and reads its client info
    async fn probe(&self, target: &NodeRecord) -> Result<ClientInfo, QueryError>;
}
