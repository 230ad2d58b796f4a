//! Node model for Peer-Atlas
//!
//! This module provides the identity and record types shared by the store,
//! the querier and the crawler:
//!
//! - `PeerId`: stable identity derived from a peer's public key
//! - `NodeRecord`: identity plus best-known endpoint and signed record blob
//! - `Edge`: "from returned to in a discovery response" within an epoch
//! - `RejectPolicy`: predicate deciding which endpoints are never crawled

mod address;
mod reject;

pub use address::{parse_address, PUBLIC_KEY_LEN};
pub use reject::{AllowAll, IpBlocklist, RejectPolicy};

use crate::AddressError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Stable peer identity: SHA-256 of the peer's public key
///
/// The transport endpoint is deliberately not part of the identity; the same
/// peer may be reached through several endpoints over its lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Derives the identity of a peer from its public key
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        let mut id = [0u8; 32];
        id.copy_from_slice(&digest);
        Self(id)
    }

    /// Lowercase hex form, used in store keys and logs
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({}..)", &self.to_hex()[..12])
    }
}

impl FromStr for PeerId {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| AddressError::InvalidKey(e.to_string()))?;
        let id: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            AddressError::InvalidKey(format!("peer id must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(id))
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.to_hex()
    }
}

impl TryFrom<String> for PeerId {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A peer as last seen: identity, endpoint and its signed record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Identity derived from `public_key`
    pub id: PeerId,

    /// Raw public key the identity is derived from
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,

    /// Best-known transport endpoint
    pub address: SocketAddr,

    /// Sequence number of `record`; higher sequences supersede lower ones
    pub seq: u64,

    /// Opaque signed record blob as returned by the network
    #[serde(with = "hex_bytes", default)]
    pub record: Vec<u8>,
}

impl NodeRecord {
    /// Creates a record for a freshly sighted peer
    pub fn new(public_key: Vec<u8>, address: SocketAddr) -> Self {
        Self {
            id: PeerId::from_public_key(&public_key),
            public_key,
            address,
            seq: 0,
            record: Vec::new(),
        }
    }

    /// Attaches a signed record with its sequence number
    pub fn with_record(mut self, seq: u64, record: Vec<u8>) -> Self {
        self.seq = seq;
        self.record = record;
        self
    }

    /// Returns the self-describing address, `enode://<key>@<ip>:<port>`
    pub fn to_url(&self) -> String {
        format!("enode://{}@{}", hex::encode(&self.public_key), self.address)
    }

    /// Returns true if this record should replace `current`
    ///
    /// A record supersedes another for the same identity only when it carries
    /// a higher sequence number and moves the peer to a different endpoint.
    pub fn supersedes(&self, current: &NodeRecord) -> bool {
        self.id == current.id && self.seq > current.seq && self.address != current.address
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_url())
    }
}

impl FromStr for NodeRecord {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_address(s)
    }
}

/// A directed "from reported to" relation observed during an epoch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: PeerId,
    pub to: PeerId,
    pub epoch: String,
    pub discovered_at: DateTime<Utc>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
