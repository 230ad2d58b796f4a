//! State module for tracking crawl progress
//!
//! This module provides the per-epoch crawl status of a peer and the
//! metadata records produced by auxiliary probes.
//!
//! # Components
//!
//! - `CrawlStatus`: Waiting / Doing / Done within one epoch
//! - `ProbeKind`: which metadata probe produced a record
//! - `MetadataStatus` and `MetadataRecord`: first-write-wins probe results

mod crawl_status;
mod metadata;

// Re-export main types
pub use crawl_status::CrawlStatus;
pub use metadata::{ClientInfo, MetadataPayload, MetadataRecord, MetadataStatus, ProbeKind};
