//! Output module for crawl statistics
//!
//! This module handles:
//! - Loading epoch and lifetime statistics from the store
//! - Serving statistics to other processes over a local socket
//! - Printing statistics for the command line

pub mod server;
pub mod stats;

pub use server::{query, StatsClient, StatsRequest, StatsResponse, StatsServer};
pub use stats::{
    load_active_peers, load_statistics, print_active_peers, print_statistics, ActivePeer,
    CrawlStatistics, StatsScope,
};
