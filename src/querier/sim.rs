//! In-memory network for tests and offline crawls
//!
//! `SimulatedNetwork` answers queries from a static directed topology. Like a
//! real discovery table it hands out a bounded window of neighbors per call,
//! rotating through the full list on successive calls, so a crawler has to
//! ask repeatedly to see everything.

use crate::node::{parse_address, NodeRecord, PeerId};
use crate::querier::{QueryError, Querier};
use crate::state::ClientInfo;
use crate::{AddressResult, ConfigResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

const DEFAULT_WINDOW: usize = 16;

#[derive(Debug, Clone)]
struct SimPeer {
    node: NodeRecord,
    neighbors: Vec<PeerId>,
    client: Option<ClientInfo>,
    record: Option<NodeRecord>,
    failing: bool,
}

/// Static topology answering `Querier` calls
#[derive(Debug)]
pub struct SimulatedNetwork {
    peers: HashMap<PeerId, SimPeer>,
    window: usize,
    latency: Duration,
    calls: Mutex<HashMap<PeerId, usize>>,
}

impl Default for SimulatedNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedNetwork {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            window: DEFAULT_WINDOW,
            latency: Duration::ZERO,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Adds a reachable peer with no neighbors
    pub fn add_peer(mut self, node: NodeRecord) -> Self {
        self.peers.entry(node.id).or_insert_with(|| SimPeer {
            node,
            neighbors: Vec::new(),
            client: None,
            record: None,
            failing: false,
        });
        self
    }

    /// Makes `from` report `to` in its discovery responses
    ///
    /// Both peers are added if unknown.
    pub fn link(self, from: &NodeRecord, to: &NodeRecord) -> Self {
        let mut network = self.add_peer(from.clone()).add_peer(to.clone());
        if let Some(peer) = network.peers.get_mut(&from.id) {
            if !peer.neighbors.contains(&to.id) {
                peer.neighbors.push(to.id);
            }
        }
        network
    }

    /// Sets the client info returned by handshake probes of `id`
    pub fn with_client(mut self, id: &PeerId, client: ClientInfo) -> Self {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.client = Some(client);
        }
        self
    }

    /// Sets the record returned by record lookups of `id`
    pub fn with_record(mut self, id: &PeerId, record: NodeRecord) -> Self {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.record = Some(record);
        }
        self
    }

    /// Makes every query against `id` time out
    pub fn failing(mut self, id: &PeerId) -> Self {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.failing = true;
        }
        self
    }

    /// Delay applied to every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Maximum number of neighbors returned per discovery call
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    /// Builds a network from a parsed topology file
    pub fn from_topology(topology: &Topology) -> AddressResult<Self> {
        let mut network = Self::new()
            .with_window(topology.window)
            .with_latency(Duration::from_millis(topology.latency_ms));

        for entry in &topology.peers {
            let node = parse_address(&entry.address)?;
            network = network.add_peer(node.clone());

            for neighbor in &entry.neighbors {
                network = network.link(&node, &parse_address(neighbor)?);
            }
            if let Some(name) = &entry.client {
                network = network.with_client(
                    &node.id,
                    ClientInfo {
                        name: name.clone(),
                        capabilities: entry.capabilities.clone(),
                    },
                );
            }
            if entry.failing {
                network = network.failing(&node.id);
            }
        }

        Ok(network)
    }

    /// Number of discovery calls made against `id` so far
    pub fn discovery_calls(&self, id: &PeerId) -> usize {
        let calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        calls.get(id).copied().unwrap_or(0)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Records a call against `id` and returns how many came before it
    fn record_call(&self, id: &PeerId) -> usize {
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        let count = calls.entry(*id).or_insert(0);
        let previous = *count;
        *count += 1;
        previous
    }

    async fn reach(&self, target: &NodeRecord) -> Result<&SimPeer, QueryError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match self.peers.get(&target.id) {
            Some(peer) if !peer.failing => Ok(peer),
            _ => Err(QueryError::Timeout),
        }
    }
}

#[async_trait]
impl Querier for SimulatedNetwork {
    async fn find_related_peers(&self, target: &NodeRecord) -> Result<Vec<NodeRecord>, QueryError> {
        let call = self.record_call(&target.id);
        let peer = self.reach(target).await?;

        let neighbors = &peer.neighbors;
        let selected: Vec<&PeerId> = if neighbors.len() <= self.window {
            neighbors.iter().collect()
        } else {
            let start = (call * self.window) % neighbors.len();
            neighbors.iter().cycle().skip(start).take(self.window).collect()
        };

        Ok(selected
            .into_iter()
            .filter_map(|id| self.peers.get(id).map(|p| p.node.clone()))
            .collect())
    }

    async fn request_record(&self, target: &NodeRecord) -> Result<NodeRecord, QueryError> {
        let peer = self.reach(target).await?;
        Ok(peer.record.clone().unwrap_or_else(|| peer.node.clone()))
    }

    async fn probe(&self, target: &NodeRecord) -> Result<ClientInfo, QueryError> {
        let peer = self.reach(target).await?;
        peer.client
            .clone()
            .ok_or_else(|| QueryError::Refused(format!("{} closed the handshake", target.address)))
    }
}

/// Topology file for `SimulatedNetwork`
///
/// ```toml
/// window = 16
/// latency-ms = 0
///
/// [[peer]]
/// address = "enode://<key>@10.0.0.1:30303"
/// neighbors = ["enode://<key>@10.0.0.2:30303"]
/// client = "Geth/v1.10.8"
/// capabilities = ["eth/66"]
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Topology {
    #[serde(default = "default_window")]
    pub window: usize,

    #[serde(default)]
    pub latency_ms: u64,

    #[serde(default, rename = "peer")]
    pub peers: Vec<TopologyPeer>,
}

/// One `[[peer]]` entry of a topology file
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TopologyPeer {
    pub address: String,

    #[serde(default)]
    pub neighbors: Vec<String>,

    #[serde(default)]
    pub client: Option<String>,

    #[serde(default)]
    pub capabilities: Vec<String>,

    #[serde(default)]
    pub failing: bool,
}

fn default_window() -> usize {
    DEFAULT_WINDOW
}

impl Topology {
    /// Reads a topology file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}
