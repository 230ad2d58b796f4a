//! Configuration module for Peer-Atlas
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use peer_atlas::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("atlas.toml")).unwrap();
//! println!("Per-peer concurrency: {}", config.crawler.node_threads);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    Config, CrawlerConfig, ProbeConfig, RejectConfig, SeedConfig, StatsConfig, StorageConfig,
};

// Re-export parser functions
pub use parser::{load_config, load_config_with_hash, parse_config};
pub use validation::{validate, validate_epoch};

use crate::node::{parse_address, NodeRecord};
use crate::ConfigResult;

impl Config {
    /// Parses the configured seed addresses
    pub fn seed_nodes(&self) -> ConfigResult<Vec<NodeRecord>> {
        self.seeds
            .nodes
            .iter()
            .map(|s| {
                parse_address(s).map_err(|e| {
                    crate::ConfigError::InvalidAddress(format!("Invalid seed '{}': {}", s, e))
                })
            })
            .collect()
    }
}
