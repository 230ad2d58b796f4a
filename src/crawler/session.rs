//! Per-peer adaptive crawl session
//!
//! A session enumerates everything one target peer knows. Each round fans
//! out several concurrent discovery calls, sized from the observed round-trip
//! time, and writes every returned peer and edge into the store. The session
//! ends after too many consecutive erroring rounds or once rounds stop
//! producing new peers. Metadata probes run alongside the round loop.

use crate::config::{CrawlerConfig, ProbeConfig};
use crate::crawler::probe::MetadataProber;
use crate::node::{NodeRecord, PeerId};
use crate::querier::Querier;
use crate::storage::Store;
use crate::AtlasError;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// Round-trip time that buys one additional concurrent discovery call
const RTT_PER_THREAD: Duration = Duration::from_millis(100);

/// Rounds between progress lines at info level
const PROGRESS_EVERY: u32 = 10;

/// Tuning for a single crawl session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound on concurrent discovery calls per round
    pub max_per_peer: usize,

    /// Consecutive erroring rounds that end the session
    pub error_limit: u32,

    /// Consecutive rounds without new peers that end the session
    pub stagnation_limit: u32,

    /// Round-trip estimate before the first round completes
    pub nominal_rtt: Duration,

    /// When false every round issues exactly one call
    pub adaptive: bool,

    pub handshake_probe: bool,
    pub record_probe: bool,
    pub record_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_per_peer: 10,
            error_limit: 5,
            stagnation_limit: 20,
            nominal_rtt: Duration::from_millis(100),
            adaptive: true,
            handshake_probe: true,
            record_probe: true,
            record_attempts: 3,
        }
    }
}

impl SessionConfig {
    /// Fixed single-call rounds with a shorter error budget
    pub fn non_adaptive() -> Self {
        Self {
            max_per_peer: 1,
            error_limit: 3,
            adaptive: false,
            ..Self::default()
        }
    }

    pub fn from_config(crawler: &CrawlerConfig, probes: &ProbeConfig) -> Self {
        let base = if crawler.adaptive {
            Self::default()
        } else {
            Self::non_adaptive()
        };

        Self {
            max_per_peer: if crawler.adaptive { crawler.node_threads } else { 1 },
            error_limit: crawler.error_limit.unwrap_or(base.error_limit),
            stagnation_limit: crawler.stagnation_limit,
            nominal_rtt: Duration::from_millis(crawler.nominal_rtt_ms),
            handshake_probe: probes.handshake,
            record_probe: probes.record,
            record_attempts: probes.record_attempts,
            ..base
        }
    }

    /// Number of discovery calls for the next round
    pub fn threads_for(&self, estimated_rtt: Duration, last_round_errored: bool) -> usize {
        if !self.adaptive || last_round_errored {
            return 1;
        }
        let by_rtt = (estimated_rtt.as_millis() / RTT_PER_THREAD.as_millis()) as usize;
        by_rtt.clamp(1, self.max_per_peer.max(1))
    }
}

/// Why a session's round loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    ErrorLimit,
    Stagnation,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ErrorLimit => write!(f, "error limit"),
            Self::Stagnation => write!(f, "stagnation"),
        }
    }
}

/// Final state of a finished session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub peer: PeerId,
    pub rounds: u32,

    /// Distinct peers the target returned
    pub discovered: usize,

    pub estimated_rtt: Duration,
    pub stop_reason: StopReason,
    pub last_error: Option<String>,
}

/// Crawl of one target peer
pub struct CrawlSession {
    target: NodeRecord,
    store: Arc<Store>,
    querier: Arc<dyn Querier>,
    config: SessionConfig,
}

impl CrawlSession {
    pub fn new(
        target: NodeRecord,
        store: Arc<Store>,
        querier: Arc<dyn Querier>,
        config: SessionConfig,
    ) -> Self {
        Self {
            target,
            store,
            querier,
            config,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.target.id
    }

    /// Runs the round loop and the metadata probes to completion
    ///
    /// Peer-specific failures are absorbed. Only store failures and resource
    /// exhaustion are returned as errors.
    pub async fn run(self) -> crate::Result<SessionReport> {
        tracing::debug!("Starting session for {}", self.target);

        let prober = MetadataProber::new(
            self.target.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.querier),
            &self.config,
        );

        let (report, ()) = tokio::try_join!(self.discover(), prober.run())?;

        tracing::debug!(
            "Session for {} stopped on {} after {} rounds: {} peers",
            self.target.id,
            report.stop_reason,
            report.rounds,
            report.discovered
        );
        Ok(report)
    }

    async fn discover(&self) -> crate::Result<SessionReport> {
        let mut estimated_rtt = self.config.nominal_rtt;
        let mut discovered: HashSet<PeerId> = HashSet::new();
        let mut last_error: Option<String> = None;
        let mut last_round_errored = false;
        let mut consecutive_errors = 0u32;
        let mut stagnation = 0u32;
        let mut rounds = 0u32;

        loop {
            let threads = self.config.threads_for(estimated_rtt, last_round_errored);
            let before = discovered.len();
            let started = Instant::now();

            let round_error = self.round(threads, &mut discovered).await?;

            estimated_rtt = (started.elapsed() + estimated_rtt) / 2;
            rounds += 1;

            match round_error {
                Some(error) => {
                    consecutive_errors += 1;
                    last_round_errored = true;
                    last_error = Some(error);
                }
                None => {
                    consecutive_errors = 0;
                    last_round_errored = false;
                }
            }

            if discovered.len() > before {
                stagnation = 0;
            } else {
                stagnation += 1;
            }

            tracing::debug!(
                "{} round {}: {} peers, rtt {:?}, {} threads, {} errors, {} stagnant",
                self.target.id,
                rounds,
                discovered.len(),
                estimated_rtt,
                threads,
                consecutive_errors,
                stagnation
            );
            if rounds % PROGRESS_EVERY == 0 {
                tracing::info!(
                    "{}: {} peers after {} rounds, rtt {:?}, {} threads, last error: {}",
                    self.target.id,
                    discovered.len(),
                    rounds,
                    estimated_rtt,
                    threads,
                    last_error.as_deref().unwrap_or("none")
                );
            }

            let stop_reason = if consecutive_errors >= self.config.error_limit {
                Some(StopReason::ErrorLimit)
            } else if stagnation >= self.config.stagnation_limit {
                Some(StopReason::Stagnation)
            } else {
                None
            };

            if let Some(stop_reason) = stop_reason {
                return Ok(SessionReport {
                    peer: self.target.id,
                    rounds,
                    discovered: discovered.len(),
                    estimated_rtt,
                    stop_reason,
                    last_error,
                });
            }
        }
    }

    /// Runs one round of `threads` concurrent discovery calls
    ///
    /// Returns the last error seen in the round, if any.
    async fn round(
        &self,
        threads: usize,
        discovered: &mut HashSet<PeerId>,
    ) -> crate::Result<Option<String>> {
        let mut calls = JoinSet::new();
        for _ in 0..threads {
            let querier = Arc::clone(&self.querier);
            let target = self.target.clone();
            calls.spawn(async move { querier.find_related_peers(&target).await });
        }

        let mut round_error = None;
        while let Some(joined) = calls.join_next().await {
            match joined {
                Ok(Ok(peers)) => {
                    for peer in peers {
                        self.store.put_node(&peer)?;
                        self.store.put_edge(&self.target.id, &peer.id)?;
                        discovered.insert(peer.id);
                    }
                }
                Ok(Err(e)) if e.is_fatal() => {
                    return Err(AtlasError::ResourceExhausted {
                        peer: self.target.to_url(),
                        message: e.to_string(),
                    });
                }
                Ok(Err(e)) => round_error = Some(e.summary()),
                Err(e) => round_error = Some(e.to_string()),
            }
        }

        Ok(round_error)
    }
}
