//! Peer-Atlas: a resumable topology mapper for peer-to-peer discovery networks
//!
//! This crate repeatedly asks every known peer which other peers it knows,
//! records the resulting directed graph, enriches peers with handshake and
//! record metadata, and keeps all crawl state in a durable key/value store
//! so an interrupted crawl picks up where it left off.

pub mod config;
pub mod crawler;
pub mod node;
pub mod output;
pub mod querier;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for Peer-Atlas operations
#[derive(Debug, Error)]
pub enum AtlasError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    #[error("Resource exhaustion while querying {peer}: {message}")]
    ResourceExhausted { peer: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Stats service error: {0}")]
    Stats(String),

    #[error("Crawl scheduler shut down")]
    Shutdown,
}

impl AtlasError {
    /// Returns true if this error must stop the whole process
    ///
    /// Store failures risk counter/record divergence and resource exhaustion
    /// signals systemic starvation; neither is a per-peer fault.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::ResourceExhausted { .. })
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid address in config: {0}")]
    InvalidAddress(String),
}

/// Peer address errors
#[derive(Debug, Error)]
pub enum AddressError {
    #[error("Failed to parse address: {0}")]
    Parse(String),

    #[error("Invalid address scheme: {0}")]
    InvalidScheme(String),

    #[error("Missing public key in address")]
    MissingKey,

    #[error("Invalid public key: {0}")]
    InvalidKey(String),

    #[error("Missing host in address")]
    MissingHost,

    #[error("Missing port in address")]
    MissingPort,
}

/// Result type alias for Peer-Atlas operations
pub type Result<T> = std::result::Result<T, AtlasError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for address operations
pub type AddressResult<T> = std::result::Result<T, AddressError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{Coordinator, CrawlSession, CrawlSummary, SessionConfig};
pub use node::{NodeRecord, PeerId, RejectPolicy};
pub use querier::{Querier, QueryError, SimulatedNetwork};
pub use state::{CrawlStatus, MetadataStatus, ProbeKind};
pub use storage::{CounterKind, Store};
