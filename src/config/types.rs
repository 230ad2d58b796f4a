use serde::Deserialize;

/// Main configuration structure for Peer-Atlas
///
/// Every section and key is optional; missing values fall back to the
/// defaults below.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub crawler: CrawlerConfig,
    pub probes: ProbeConfig,
    pub storage: StorageConfig,
    pub stats: StatsConfig,
    pub reject: RejectConfig,
    pub seeds: SeedConfig,
}

/// Crawl concurrency and termination settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CrawlerConfig {
    /// Maximum number of concurrent crawl sessions
    pub threads: usize,

    /// Maximum concurrent discovery calls against one peer
    pub node_threads: usize,

    /// How long the coordinator waits for in-flight sessions before re-polling (milliseconds)
    pub poll_interval_ms: u64,

    /// Consecutive erroring rounds that end a session
    ///
    /// Unset means 5 in adaptive mode and 3 otherwise.
    pub error_limit: Option<u32>,

    /// Consecutive rounds without new peers that end a session
    pub stagnation_limit: u32,

    /// Initial round-trip estimate for a new session (milliseconds)
    pub nominal_rtt_ms: u64,

    /// Size per-peer concurrency from the observed round-trip time
    pub adaptive: bool,

    /// Drop the epoch's status bookkeeping once the crawl is quiescent
    pub purge_on_completion: bool,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            threads: 30,
            node_threads: 10,
            poll_interval_ms: 3000,
            error_limit: None,
            stagnation_limit: 20,
            nominal_rtt_ms: 100,
            adaptive: true,
            purge_on_completion: true,
        }
    }
}

/// Metadata probe settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProbeConfig {
    /// Run the handshake probe (client name and capabilities)
    pub handshake: bool,

    /// Run the signed record lookup
    pub record: bool,

    /// Attempts for the record lookup before it is recorded as failed
    pub record_attempts: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            handshake: true,
            record: true,
            record_attempts: 3,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StorageConfig {
    /// Path to the SQLite database file
    pub database_path: String,

    /// Epoch to start when no unfinished epoch is persisted (defaults to today)
    pub epoch: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: "./data/atlas.db".to_string(),
            epoch: None,
        }
    }
}

/// Local statistics service
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StatsConfig {
    /// Unix socket the crawl process serves statistics on
    pub socket_path: String,

    pub enabled: bool,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            socket_path: "./data/atlas.sock".to_string(),
            enabled: true,
        }
    }
}

/// Endpoints that are never crawled
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RejectConfig {
    pub blocked_ips: Vec<String>,
}

impl Default for RejectConfig {
    fn default() -> Self {
        Self {
            blocked_ips: vec!["94.79.55.28".to_string()],
        }
    }
}

/// Seed peers, as `enode://<key>@<ip>:<port>` addresses
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SeedConfig {
    pub nodes: Vec<String>,
}
