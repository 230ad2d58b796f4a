//! Statistics generation from the crawl store
//!
//! This module provides functionality for extracting and displaying
//! crawl statistics from the storage layer.

use crate::node::PeerId;
use crate::state::ProbeKind;
use crate::storage::{CounterKind, StorageResult, Store};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Which counters a statistics snapshot reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatsScope {
    /// Edges and metadata recorded in the current epoch
    Today,

    /// Edges and metadata across all epochs
    Lifetime,
}

impl fmt::Display for StatsScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Today => write!(f, "today"),
            Self::Lifetime => write!(f, "lifetime"),
        }
    }
}

/// Crawl statistics summary
///
/// Node counts are always lifetime; Doing and Done are always the current
/// epoch's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlStatistics {
    pub scope: StatsScope,
    pub epoch: String,

    /// Total number of peers ever sighted
    pub nodes: u64,

    /// Edges recorded within the scope
    pub edges: u64,

    /// Peers with a session in flight
    pub doing: u64,

    /// Peers completed this epoch
    pub done: u64,

    /// Handshake results recorded within the scope
    pub handshakes: u64,

    /// Record lookups recorded within the scope
    pub records: u64,
}

/// A peer with a session in flight
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivePeer {
    pub id: PeerId,
    pub address: Option<SocketAddr>,

    /// Edges reported by this peer so far this epoch
    pub edges: u64,
}

/// Loads statistics from the store
///
/// # Arguments
///
/// * `store` - The store to query
/// * `scope` - Whether edge and metadata counts cover this epoch or all time
///
/// # Returns
///
/// * `Ok(CrawlStatistics)` - Successfully loaded statistics
/// * `Err(StorageError)` - Failed to read a counter
pub fn load_statistics(store: &Store, scope: StatsScope) -> StorageResult<CrawlStatistics> {
    let (edges, handshakes, records) = match scope {
        StatsScope::Today => (
            CounterKind::EpochEdges,
            CounterKind::EpochMetadata(ProbeKind::HandshakeInfo),
            CounterKind::EpochMetadata(ProbeKind::ExtendedRecord),
        ),
        StatsScope::Lifetime => (
            CounterKind::Edges,
            CounterKind::Metadata(ProbeKind::HandshakeInfo),
            CounterKind::Metadata(ProbeKind::ExtendedRecord),
        ),
    };

    Ok(CrawlStatistics {
        scope,
        epoch: store.epoch().to_string(),
        nodes: store.count(&CounterKind::Nodes)?,
        edges: store.count(&edges)?,
        doing: store.count_doing()?,
        done: store.count(&CounterKind::EpochDone)?,
        handshakes: store.count(&handshakes)?,
        records: store.count(&records)?,
    })
}

/// Loads the peers currently being crawled, busiest first
pub fn load_active_peers(store: &Store) -> StorageResult<Vec<ActivePeer>> {
    let mut active = Vec::new();
    for (id, edges) in store.active_peers()? {
        let address = store.get_node(&id)?.map(|node| node.address);
        active.push(ActivePeer { id, address, edges });
    }
    active.sort_by(|a, b| b.edges.cmp(&a.edges));
    Ok(active)
}

/// Prints statistics to stdout in a formatted manner
///
/// # Arguments
///
/// * `stats` - The statistics to display
pub fn print_statistics(stats: &CrawlStatistics) {
    println!("=== Crawl Statistics ({}, epoch {}) ===\n", stats.scope, stats.epoch);
    println!("  Nodes: {}", stats.nodes);
    println!("  Edges: {}", stats.edges);
    println!("  Doing: {}", stats.doing);
    println!("  Done: {}", stats.done);
    println!("  Handshakes: {}", stats.handshakes);
    println!("  Records: {}", stats.records);

    let known = stats.nodes.max(1) as f64;
    println!(
        "\nProgress: {:.1}% of known peers done this epoch",
        stats.done as f64 / known * 100.0
    );
}

/// Prints active peers, one per line
pub fn print_active_peers(peers: &[ActivePeer]) {
    println!("Active sessions: {}", peers.len());
    for peer in peers {
        let address = peer
            .address
            .map(|a| a.to_string())
            .unwrap_or_else(|| "?".to_string());
        println!("  {} {} {}", peer.id, address, peer.edges);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeRecord;
    use crate::state::{MetadataStatus, ProbeKind};

    fn node(n: u8) -> NodeRecord {
        NodeRecord::new(vec![n; 64], format!("10.0.0.{}:30303", n).parse().unwrap())
    }

    #[test]
    fn test_today_and_lifetime_scopes() {
        let store = Store::in_memory("2021-09-01").unwrap();
        let (a, b) = (node(1), node(2));
        store.put_node(&a).unwrap();
        store.put_node(&b).unwrap();
        store.put_edge(&a.id, &b.id).unwrap();
        store.mark_doing(&a.id).unwrap();
        store
            .put_metadata(&b.id, ProbeKind::HandshakeInfo, MetadataStatus::Failed("x".into()))
            .unwrap();

        let today = load_statistics(&store, StatsScope::Today).unwrap();
        assert_eq!(today.nodes, 2);
        assert_eq!(today.edges, 1);
        assert_eq!(today.doing, 1);
        assert_eq!(today.done, 0);
        assert_eq!(today.handshakes, 1);
        assert_eq!(today.records, 0);

        let lifetime = load_statistics(&store, StatsScope::Lifetime).unwrap();
        assert_eq!(lifetime.scope, StatsScope::Lifetime);
        assert_eq!(lifetime.edges, 1);
        assert_eq!(lifetime.epoch, "2021-09-01");
    }

    #[test]
    fn test_active_peers_sorted_by_edges() {
        let store = Store::in_memory("2021-09-01").unwrap();
        let nodes: Vec<_> = (1..=4).map(node).collect();
        for n in &nodes {
            store.put_node(n).unwrap();
        }
        store.mark_doing(&nodes[0].id).unwrap();
        store.mark_doing(&nodes[1].id).unwrap();
        store.put_edge(&nodes[1].id, &nodes[2].id).unwrap();
        store.put_edge(&nodes[1].id, &nodes[3].id).unwrap();

        let active = load_active_peers(&store).unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].id, nodes[1].id);
        assert_eq!(active[0].edges, 2);
        assert_eq!(active[0].address, Some(nodes[1].address));
        assert_eq!(active[1].edges, 0);
    }
}
