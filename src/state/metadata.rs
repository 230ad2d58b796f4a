use crate::node::{NodeRecord, PeerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Auxiliary probes run against each crawled peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProbeKind {
    /// Direct transport handshake reporting client name and capabilities
    HandshakeInfo,

    /// Lookup of the peer's latest signed node record
    ExtendedRecord,
}

impl ProbeKind {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::HandshakeInfo => "handshake",
            Self::ExtendedRecord => "record",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "handshake" => Some(Self::HandshakeInfo),
            "record" => Some(Self::ExtendedRecord),
            _ => None,
        }
    }

    pub fn all() -> [Self; 2] {
        [Self::HandshakeInfo, Self::ExtendedRecord]
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// Client identification returned by a handshake probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub capabilities: Vec<String>,
}

impl fmt::Display for ClientInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.capabilities.join(","))
    }
}

/// Successful probe payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataPayload {
    Handshake(ClientInfo),
    Record(NodeRecord),
}

/// Outcome of a probe for one (peer, kind)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataStatus {
    Unqueried,
    Success(MetadataPayload),
    Failed(String),
}

impl MetadataStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Persisted probe result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub peer: PeerId,
    pub kind: ProbeKind,
    pub status: MetadataStatus,
    pub recorded_at: DateTime<Utc>,
}

impl MetadataRecord {
    pub fn new(peer: PeerId, kind: ProbeKind, status: MetadataStatus) -> Self {
        Self {
            peer,
            kind,
            status,
            recorded_at: Utc::now(),
        }
    }
}
