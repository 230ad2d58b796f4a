//! Database schema and key layout
//!
//! The SQLite database holds a single ordered key/value table; all crawl
//! state is encoded in the keys below. Ids are lowercase hex, the epoch is a
//! date-like string that never contains ':'.
//!
//! | Key | Value |
//! |---|---|
//! | `meta:epoch`, `meta:config-hash` | string |
//! | `n:<id>` | NodeRecord JSON |
//! | `r:<epoch>:<from>:<to>` | Edge JSON |
//! | `s:<epoch>:i:<id>`, `s:<epoch>:d:<id>` | Doing / Done timestamp |
//! | `m:<kind>:<id>` | MetadataRecord JSON |
//! | `x:<epoch>:<kind>:<id>` | epoch index of metadata writes |
//! | `c:...` | u64 big-endian counters, see `CounterKind` |

use crate::node::PeerId;
use crate::state::ProbeKind;
use std::fmt;

/// SQL schema for the key/value table
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key BLOB PRIMARY KEY NOT NULL,
    value BLOB NOT NULL
) WITHOUT ROWID;
"#;

/// Initializes the database schema
///
/// # Arguments
///
/// * `conn` - The database connection
///
/// # Returns
///
/// * `Ok(())` - Schema initialized successfully
/// * `Err(rusqlite::Error)` - Failed to initialize schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

pub const EPOCH_KEY: &[u8] = b"meta:epoch";
pub const CONFIG_HASH_KEY: &[u8] = b"meta:config-hash";

const NODES_PREFIX: &str = "n:";

/// Maintained aggregate counts
///
/// Each kind maps to one counter key and one record prefix; the counter
/// always equals the number of keys under the prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    /// Lifetime node count
    Nodes,

    /// Lifetime edge count across all epochs
    Edges,

    /// Edges discovered this epoch
    EpochEdges,

    /// Edges discovered this epoch from one source peer
    PeerEdges(PeerId),

    /// Peers completed this epoch
    EpochDone,

    /// Lifetime metadata records of one kind
    Metadata(ProbeKind),

    /// Metadata records of one kind written this epoch
    EpochMetadata(ProbeKind),
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nodes => write!(f, "nodes"),
            Self::Edges => write!(f, "edges"),
            Self::EpochEdges => write!(f, "epoch edges"),
            Self::PeerEdges(id) => write!(f, "edges from {}", id),
            Self::EpochDone => write!(f, "epoch done"),
            Self::Metadata(kind) => write!(f, "{} metadata", kind),
            Self::EpochMetadata(kind) => write!(f, "epoch {} metadata", kind),
        }
    }
}

/// Key builder bound to one epoch
#[derive(Debug, Clone)]
pub struct Keys {
    epoch: String,
}

impl Keys {
    pub fn new(epoch: impl Into<String>) -> Self {
        Self {
            epoch: epoch.into(),
        }
    }

    pub fn epoch(&self) -> &str {
        &self.epoch
    }

    pub fn node(&self, id: &PeerId) -> Vec<u8> {
        format!("{}{}", NODES_PREFIX, id).into_bytes()
    }

    pub fn nodes_prefix(&self) -> Vec<u8> {
        NODES_PREFIX.as_bytes().to_vec()
    }

    pub fn edge(&self, from: &PeerId, to: &PeerId) -> Vec<u8> {
        format!("r:{}:{}:{}", self.epoch, from, to).into_bytes()
    }

    pub fn edges_from_prefix(&self, from: &PeerId) -> Vec<u8> {
        format!("r:{}:{}:", self.epoch, from).into_bytes()
    }

    pub fn doing(&self, id: &PeerId) -> Vec<u8> {
        format!("s:{}:i:{}", self.epoch, id).into_bytes()
    }

    pub fn doing_prefix(&self) -> Vec<u8> {
        format!("s:{}:i:", self.epoch).into_bytes()
    }

    pub fn done(&self, id: &PeerId) -> Vec<u8> {
        format!("s:{}:d:{}", self.epoch, id).into_bytes()
    }

    pub fn done_prefix(&self) -> Vec<u8> {
        format!("s:{}:d:", self.epoch).into_bytes()
    }

    pub fn metadata(&self, kind: ProbeKind, id: &PeerId) -> Vec<u8> {
        format!("m:{}:{}", kind, id).into_bytes()
    }

    pub fn epoch_metadata(&self, kind: ProbeKind, id: &PeerId) -> Vec<u8> {
        format!("x:{}:{}:{}", self.epoch, kind, id).into_bytes()
    }

    /// Prefix under which the per-peer edge counters of this epoch live
    pub fn peer_edge_counters_prefix(&self) -> Vec<u8> {
        format!("c:{}:edges:", self.epoch).into_bytes()
    }

    /// Returns the key holding the maintained value of `kind`
    pub fn counter(&self, kind: &CounterKind) -> Vec<u8> {
        let key = match kind {
            CounterKind::Nodes => "c:nodes".to_string(),
            CounterKind::Edges => "c:edges".to_string(),
            CounterKind::EpochEdges => format!("c:{}:edges", self.epoch),
            CounterKind::PeerEdges(id) => format!("c:{}:edges:{}", self.epoch, id),
            CounterKind::EpochDone => format!("c:{}:done", self.epoch),
            CounterKind::Metadata(kind) => format!("c:meta:{}", kind),
            CounterKind::EpochMetadata(kind) => format!("c:{}:meta:{}", self.epoch, kind),
        };
        key.into_bytes()
    }

    /// Returns the record prefix whose cardinality `kind` counts
    pub fn prefix(&self, kind: &CounterKind) -> Vec<u8> {
        match kind {
            CounterKind::Nodes => self.nodes_prefix(),
            CounterKind::Edges => b"r:".to_vec(),
            CounterKind::EpochEdges => format!("r:{}:", self.epoch).into_bytes(),
            CounterKind::PeerEdges(id) => self.edges_from_prefix(id),
            CounterKind::EpochDone => self.done_prefix(),
            CounterKind::Metadata(kind) => format!("m:{}:", kind).into_bytes(),
            CounterKind::EpochMetadata(kind) => {
                format!("x:{}:{}:", self.epoch, kind).into_bytes()
            }
        }
    }

    /// Extracts the trailing peer id of a key that starts with `prefix`
    pub fn peer_from_key(key: &[u8], prefix: &[u8]) -> Option<PeerId> {
        let tail = key.strip_prefix(prefix)?;
        std::str::from_utf8(tail).ok()?.parse().ok()
    }
}

/// Encodes a counter value
pub fn encode_counter(value: u64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

/// Decodes a counter value, None if the bytes are not a u64
pub fn decode_counter(bytes: &[u8]) -> Option<u64> {
    let raw: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(raw))
}
