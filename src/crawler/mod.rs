//! Crawler module for mapping the peer graph
//!
//! This module contains the core crawling logic, including:
//! - Per-peer adaptive discovery sessions
//! - Handshake and record metadata probes
//! - Peer selection, reject policy and global session limits
//! - Overall crawl coordination to quiescence
//! - Metadata enrichment over every stored peer

mod coordinator;
mod enrich;
mod probe;
mod scheduler;
mod session;

pub use coordinator::{Coordinator, CrawlSummary};
pub use enrich::{enrich, EnrichSummary};
pub use probe::MetadataProber;
pub use scheduler::{Next, Scheduler};
pub use session::{CrawlSession, SessionConfig, SessionReport, StopReason};
