//! Peer-Atlas main entry point
//!
//! This is the command-line interface for the Peer-Atlas topology mapper.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use peer_atlas::config::{load_config_with_hash, validate, validate_epoch, Config};
use peer_atlas::node::{parse_address, NodeRecord};
use peer_atlas::output::{
    print_active_peers, print_statistics, query, StatsRequest, StatsResponse, StatsServer,
};
use peer_atlas::crawler::{enrich, SessionConfig};
use peer_atlas::querier::{SimulatedNetwork, Topology};
use peer_atlas::state::ProbeKind;
use peer_atlas::storage::{open_storage, Store};
use peer_atlas::Coordinator;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Peer-Atlas: a resumable topology mapper for peer-to-peer networks
///
/// Peer-Atlas asks every known peer which peers it knows, records the
/// resulting directed graph, and probes peers for client and record
/// metadata. Interrupted crawls resume from the store.
#[derive(Parser, Debug)]
#[command(name = "peer-atlas")]
#[command(version = "1.0.0")]
#[command(about = "A resumable topology mapper for peer-to-peer networks", long_about = None)]
struct Cli {
    /// Path to TOML configuration file (defaults apply when omitted)
    #[arg(short, long, value_name = "CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Crawl epoch to use instead of today's date
    #[arg(long, global = true)]
    epoch: Option<String>,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crawl the network until no peer is waiting
    Crawl(CrawlArgs),

    /// Probe every stored peer that lacks one kind of metadata
    Enrich(EnrichArgs),

    /// Drop the current epoch's status bookkeeping
    Purge,

    /// Show statistics from a running crawl or the store
    Query(QueryArgs),

    /// Read or write raw store keys
    Db {
        #[command(subcommand)]
        op: DbCommand,
    },

    /// Compare cached counters against the records they count
    Check {
        /// Rewrite mismatching counters from a full scan
        #[arg(long)]
        repair: bool,
    },
}

#[derive(Args, Debug)]
struct CrawlArgs {
    /// Topology file describing the simulated network to crawl
    #[arg(long, value_name = "TOPOLOGY")]
    simulate: PathBuf,

    /// Additional seed peer (enode://<key>@<ip>:<port>), may be repeated
    #[arg(long = "seed", value_name = "ADDRESS")]
    seeds: Vec<String>,

    /// Maximum concurrent sessions
    #[arg(long)]
    threads: Option<usize>,

    /// Maximum concurrent queries per peer
    #[arg(long)]
    node_threads: Option<usize>,

    /// Skip the handshake probe
    #[arg(long)]
    no_handshake: bool,

    /// Skip the record lookup probe
    #[arg(long)]
    no_record: bool,
}

#[derive(Args, Debug)]
struct EnrichArgs {
    /// Topology file describing the simulated network to probe
    #[arg(long, value_name = "TOPOLOGY")]
    simulate: PathBuf,

    /// Metadata to collect: handshake or record
    #[arg(long, value_parser = parse_probe_kind)]
    kind: ProbeKind,

    /// Maximum concurrent probes
    #[arg(long, default_value_t = 16)]
    threads: usize,
}

fn parse_probe_kind(value: &str) -> Result<ProbeKind, String> {
    ProbeKind::from_db_string(value)
        .ok_or_else(|| format!("unknown probe kind '{}' (expected handshake or record)", value))
}

#[derive(Args, Debug)]
#[group(multiple = false)]
struct QueryArgs {
    /// Counts for the current epoch (default)
    #[arg(long)]
    today: bool,

    /// Lifetime counts
    #[arg(long)]
    all: bool,

    /// Number of known peers
    #[arg(long)]
    nodes: bool,

    /// Peers with a session in flight
    #[arg(long)]
    active: bool,
}

impl QueryArgs {
    fn request(&self) -> StatsRequest {
        if self.all {
            StatsRequest::Lifetime
        } else if self.nodes {
            StatsRequest::NodeCount
        } else if self.active {
            StatsRequest::Active
        } else {
            StatsRequest::Today
        }
    }
}

#[derive(Subcommand, Debug)]
enum DbCommand {
    /// Print the value stored at a key
    Get { key: String },

    /// Store a UTF-8 value at a key
    Put { key: String, value: String },

    /// Remove a key
    Delete { key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    let (mut config, config_hash) = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            let (config, hash) = load_config_with_hash(path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            (config, Some(hash))
        }
        None => (Config::default(), None),
    };

    if let Some(epoch) = cli.epoch {
        validate_epoch(&epoch)?;
        config.storage.epoch = Some(epoch);
    }

    match cli.command {
        Command::Crawl(args) => handle_crawl(config, config_hash, args).await,
        Command::Enrich(args) => handle_enrich(&config, args).await,
        Command::Purge => handle_purge(&config),
        Command::Query(args) => handle_query(&config, args.request()).await,
        Command::Db { op } => handle_db(&config, op),
        Command::Check { repair } => handle_check(&config, repair),
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("peer_atlas=info,warn"),
            1 => EnvFilter::new("peer_atlas=debug,info"),
            2 => EnvFilter::new("peer_atlas=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

fn open_store(config: &Config) -> anyhow::Result<Store> {
    let path = Path::new(&config.storage.database_path);
    open_storage(path, config.storage.epoch.as_deref())
        .with_context(|| format!("Failed to open store at {}", path.display()))
}

fn open_store_read_only(config: &Config) -> anyhow::Result<Store> {
    let path = Path::new(&config.storage.database_path);
    Store::open_read_only(path)
        .with_context(|| format!("Failed to open store at {}", path.display()))
}

/// Handles the crawl command against a simulated topology
async fn handle_crawl(
    mut config: Config,
    config_hash: Option<String>,
    args: CrawlArgs,
) -> anyhow::Result<()> {
    if let Some(threads) = args.threads {
        config.crawler.threads = threads;
    }
    if let Some(node_threads) = args.node_threads {
        config.crawler.node_threads = node_threads;
    }
    if args.no_handshake {
        config.probes.handshake = false;
    }
    if args.no_record {
        config.probes.record = false;
    }
    config.seeds.nodes.extend(args.seeds);
    validate(&config)?;

    let topology = Topology::load(&args.simulate)
        .with_context(|| format!("Failed to load topology {}", args.simulate.display()))?;
    let network = SimulatedNetwork::from_topology(&topology)?;
    tracing::info!("Simulating {} peers", network.peer_count());

    let store = Arc::new(open_store(&config)?);
    if let Some(hash) = config_hash {
        if let Some(previous) = store.record_config_hash(&hash)? {
            if previous != hash {
                tracing::warn!(
                    "Configuration changed since the last run (was {}), resuming epoch {} anyway",
                    previous,
                    store.epoch()
                );
            }
        }
    }

    let mut seeds = config.seed_nodes()?;
    if seeds.is_empty() {
        seeds = topology
            .peers
            .iter()
            .map(|peer| parse_address(&peer.address))
            .collect::<Result<Vec<NodeRecord>, _>>()?;
    }

    let coordinator = Coordinator::from_config(&config, Arc::clone(&store), Arc::new(network))?;
    coordinator.seed(&seeds)?;

    let stats = if config.stats.enabled {
        let server = StatsServer::bind(&config.stats.socket_path, Arc::clone(&store))?;
        Some(tokio::spawn(server.run()))
    } else {
        None
    };

    let result = tokio::select! {
        result = coordinator.run() => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    if let Some(stats) = stats {
        stats.abort();
        let _ = stats.await;
    }

    let summary = match result {
        Some(result) => result?,
        None => {
            tracing::warn!("Interrupted; in-flight peers resume on the next run");
            return Ok(());
        }
    };

    println!("=== Crawl Complete ===\n");
    println!("  Sessions: {}", summary.crawled);
    println!("  Rejected: {}", summary.rejected);
    println!("  Skipped: {}", summary.skipped);
    println!("  Failed: {}", summary.failed);
    println!("  Duplicate completions: {}", summary.duplicate_completions);
    println!("  Peers reported: {}", summary.discovered);
    if let Some(purged) = summary.purged {
        println!("  Status keys purged: {}", purged);
    }
    println!("  Elapsed: {:.1}s", summary.elapsed.as_secs_f64());

    Ok(())
}

/// Handles the enrich command against a simulated topology
async fn handle_enrich(config: &Config, args: EnrichArgs) -> anyhow::Result<()> {
    if args.threads == 0 {
        bail!("--threads must be at least 1");
    }
    validate(config)?;

    let topology = Topology::load(&args.simulate)
        .with_context(|| format!("Failed to load topology {}", args.simulate.display()))?;
    let network = SimulatedNetwork::from_topology(&topology)?;

    let store = Arc::new(open_store(config)?);
    let session_config = SessionConfig::from_config(&config.crawler, &config.probes);
    let summary = enrich(
        store,
        Arc::new(network),
        args.kind,
        args.threads,
        &session_config,
    )
    .await?;

    println!("=== Enrichment Complete ===\n");
    println!("  Kind: {}", args.kind);
    println!("  Probed: {}", summary.probed);
    println!("  Already known: {}", summary.skipped);
    println!("  Failed: {}", summary.failed);
    println!("  Elapsed: {:.1}s", summary.elapsed.as_secs_f64());

    Ok(())
}

/// Handles the purge command
fn handle_purge(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let epoch = store.epoch().to_string();
    let removed = store.purge_epoch()?;
    println!("✓ Purged {} keys from epoch {}", removed, epoch);
    Ok(())
}

/// Handles the query command
async fn handle_query(config: &Config, request: StatsRequest) -> anyhow::Result<()> {
    let socket = Path::new(&config.stats.socket_path);
    let response = query(socket, request, || {
        Ok(Store::open_read_only(Path::new(&config.storage.database_path))?)
    })
    .await?;

    match response {
        StatsResponse::NodeCount(count) => println!("{}", count),
        StatsResponse::Statistics(stats) => print_statistics(&stats),
        StatsResponse::Active(peers) => print_active_peers(&peers),
        StatsResponse::Error(message) => bail!("Stats query failed: {}", message),
    }

    Ok(())
}

/// Handles the db command
fn handle_db(config: &Config, op: DbCommand) -> anyhow::Result<()> {
    match op {
        DbCommand::Get { key } => match open_store_read_only(config)?.get_raw(key.as_bytes())? {
            Some(value) => match String::from_utf8(value) {
                Ok(text) => println!("{}", text),
                Err(e) => println!("0x{}", hex::encode(e.into_bytes())),
            },
            None => bail!("Key not found: {}", key),
        },
        DbCommand::Put { key, value } => {
            open_store(config)?.put_raw(key.as_bytes(), value.as_bytes())?;
            println!("✓ Stored {}", key);
        }
        DbCommand::Delete { key } => {
            open_store(config)?.delete_raw(key.as_bytes())?;
            println!("✓ Deleted {}", key);
        }
    }

    Ok(())
}

/// Handles the check command
fn handle_check(config: &Config, repair: bool) -> anyhow::Result<()> {
    let store = if repair {
        open_store(config)?
    } else {
        open_store_read_only(config)?
    };
    let mismatches = store.verify_counters()?;

    if mismatches.is_empty() {
        println!("✓ All counters consistent (epoch {})", store.epoch());
        return Ok(());
    }

    for mismatch in &mismatches {
        println!(
            "  {}: stored {}, actual {}",
            mismatch.kind, mismatch.stored, mismatch.actual
        );
    }

    if !repair {
        bail!(
            "{} counters inconsistent; rerun with --repair to rebuild them",
            mismatches.len()
        );
    }

    for mismatch in &mismatches {
        store.rebuild_counter(&mismatch.kind)?;
    }
    println!("✓ Rebuilt {} counters", mismatches.len());

    Ok(())
}
