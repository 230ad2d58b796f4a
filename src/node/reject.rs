use crate::config::RejectConfig;
use crate::{ConfigError, ConfigResult};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

/// Predicate over a peer endpoint, consulted before a peer is marked Doing
///
/// A rejected peer is skipped for the rest of the epoch: it is never marked
/// Doing or Done and never queried, so it contributes no edges.
pub trait RejectPolicy: Send + Sync {
    /// Returns true if the peer at `address` must not be crawled
    fn rejects(&self, address: &SocketAddr) -> bool;
}

impl<F> RejectPolicy for F
where
    F: Fn(&SocketAddr) -> bool + Send + Sync,
{
    fn rejects(&self, address: &SocketAddr) -> bool {
        self(address)
    }
}

/// Policy that crawls every peer
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl RejectPolicy for AllowAll {
    fn rejects(&self, _address: &SocketAddr) -> bool {
        false
    }
}

/// Static IP blocklist
#[derive(Debug, Clone, Default)]
pub struct IpBlocklist {
    blocked: HashSet<IpAddr>,
}

impl IpBlocklist {
    pub fn new<I: IntoIterator<Item = IpAddr>>(ips: I) -> Self {
        Self {
            blocked: ips.into_iter().map(|ip| ip.to_canonical()).collect(),
        }
    }

    /// Builds the blocklist from the `[reject]` config section
    pub fn from_config(config: &RejectConfig) -> ConfigResult<Self> {
        let ips = config
            .blocked_ips
            .iter()
            .map(|s| {
                s.parse::<IpAddr>().map_err(|e| {
                    ConfigError::InvalidAddress(format!("Invalid blocked IP '{}': {}", s, e))
                })
            })
            .collect::<ConfigResult<Vec<_>>>()?;
        Ok(Self::new(ips))
    }

    pub fn is_blocked(&self, ip: &IpAddr) -> bool {
        self.blocked.contains(&ip.to_canonical())
    }

    pub fn len(&self) -> usize {
        self.blocked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
    }
}

impl RejectPolicy for IpBlocklist {
    fn rejects(&self, address: &SocketAddr) -> bool {
        self.is_blocked(&address.ip())
    }
}
