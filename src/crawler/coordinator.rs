//! Crawler coordinator - main crawl orchestration logic
//!
//! The coordinator drains the store's waiting queue, launches one session
//! per peer under the scheduler's global permit, and keeps polling while
//! sessions are in flight because they feed newly discovered peers back into
//! the queue. It stops once nothing is waiting and nothing is running.

use crate::config::Config;
use crate::crawler::scheduler::{Next, Scheduler};
use crate::crawler::session::{CrawlSession, SessionConfig, SessionReport};
use crate::node::{IpBlocklist, NodeRecord, RejectPolicy};
use crate::querier::Querier;
use crate::storage::Store;
use crate::AtlasError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinSet};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

type SessionOutcome = crate::Result<(SessionReport, bool)>;

/// Totals for one coordinator run
#[derive(Debug, Clone, Default)]
pub struct CrawlSummary {
    /// Sessions that ran to completion
    pub crawled: usize,

    /// Peers skipped by the reject policy
    pub rejected: usize,

    /// Waiting identities that were already Done
    pub skipped: usize,

    /// Sessions that ended in a non-fatal error or panicked
    pub failed: usize,

    /// Completions for identities another session already finished
    pub duplicate_completions: usize,

    /// Sum of distinct peers reported across sessions
    pub discovered: usize,

    /// Keys removed by the epoch purge, if it ran
    pub purged: Option<u64>,

    pub elapsed: Duration,
}

/// Main crawler coordinator structure
pub struct Coordinator {
    store: Arc<Store>,
    querier: Arc<dyn Querier>,
    scheduler: Scheduler,
    session_config: SessionConfig,
    poll_interval: Duration,
    purge_on_completion: bool,
}

impl Coordinator {
    /// Creates a new coordinator instance
    ///
    /// # Arguments
    ///
    /// * `store` - Crawl state shared with every session
    /// * `querier` - Network primitives
    /// * `reject` - Policy applied before each launch
    /// * `threads` - Maximum number of concurrent sessions
    /// * `session_config` - Tuning passed to every session
    pub fn new(
        store: Arc<Store>,
        querier: Arc<dyn Querier>,
        reject: Arc<dyn RejectPolicy>,
        threads: usize,
        session_config: SessionConfig,
    ) -> Self {
        Self {
            scheduler: Scheduler::new(threads, Arc::clone(&store), reject),
            store,
            querier,
            session_config,
            poll_interval: DEFAULT_POLL_INTERVAL,
            purge_on_completion: true,
        }
    }

    /// Builds a coordinator from the loaded configuration
    pub fn from_config(
        config: &Config,
        store: Arc<Store>,
        querier: Arc<dyn Querier>,
    ) -> crate::ConfigResult<Self> {
        let blocklist = IpBlocklist::from_config(&config.reject)?;
        let session_config = SessionConfig::from_config(&config.crawler, &config.probes);

        Ok(Self::new(
            store,
            querier,
            Arc::new(blocklist),
            config.crawler.threads,
            session_config,
        )
        .with_poll_interval(Duration::from_millis(config.crawler.poll_interval_ms))
        .with_purge_on_completion(config.crawler.purge_on_completion))
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_purge_on_completion(mut self, purge: bool) -> Self {
        self.purge_on_completion = purge;
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Inserts seed peers, returning how many were new
    pub fn seed(&self, nodes: &[NodeRecord]) -> crate::Result<usize> {
        let mut inserted = 0;
        for node in nodes {
            if self.store.put_node(node)? {
                inserted += 1;
            }
        }
        tracing::info!("Seeded {} of {} peers", inserted, nodes.len());
        Ok(inserted)
    }

    /// Runs the crawl until no peer is waiting and no session is in flight
    ///
    /// A fatal error aborts all in-flight sessions and is returned without
    /// purging, so the next start resumes the interrupted peers.
    pub async fn run(&self) -> crate::Result<CrawlSummary> {
        let started = Instant::now();
        let mut sessions = JoinSet::new();
        let mut summary = CrawlSummary::default();

        tracing::info!(
            "Starting crawl of epoch {} with {} waiting peers, {} sessions max",
            self.store.epoch(),
            self.store.waiting_len(),
            self.scheduler.capacity()
        );

        if let Err(e) = self.drive(&mut sessions, &mut summary).await {
            tracing::error!("Stopping crawl: {}", e);
            sessions.abort_all();
            return Err(e);
        }

        if self.purge_on_completion {
            summary.purged = Some(self.store.purge_epoch()?);
        }

        summary.elapsed = started.elapsed();
        tracing::info!(
            "Crawl complete: {} sessions, {} rejected, {} failed, {} duplicates in {:.1}s",
            summary.crawled,
            summary.rejected,
            summary.failed,
            summary.duplicate_completions,
            summary.elapsed.as_secs_f64()
        );

        Ok(summary)
    }

    async fn drive(
        &self,
        sessions: &mut JoinSet<SessionOutcome>,
        summary: &mut CrawlSummary,
    ) -> crate::Result<()> {
        loop {
            while let Some(next) = self.scheduler.next_peer()? {
                match next {
                    Next::Crawl(node) => self.launch(node, sessions).await?,
                    Next::Rejected(_) => summary.rejected += 1,
                    Next::Skipped(_) => summary.skipped += 1,
                }

                while let Some(joined) = sessions.try_join_next() {
                    self.finish(joined, summary)?;
                }
            }

            if sessions.is_empty() {
                return Ok(());
            }

            match tokio::time::timeout(self.poll_interval, sessions.join_next()).await {
                Ok(Some(joined)) => self.finish(joined, summary)?,
                Ok(None) => {}
                Err(_) => tracing::debug!(
                    "{} sessions in flight, {} waiting",
                    sessions.len(),
                    self.store.waiting_len()
                ),
            }
        }
    }

    async fn launch(
        &self,
        node: NodeRecord,
        sessions: &mut JoinSet<SessionOutcome>,
    ) -> crate::Result<()> {
        let permit = self.scheduler.acquire().await?;
        self.store.mark_doing(&node.id)?;

        let peer = node.id;
        let store = Arc::clone(&self.store);
        let session = CrawlSession::new(
            node,
            Arc::clone(&self.store),
            Arc::clone(&self.querier),
            self.session_config.clone(),
        );

        sessions.spawn(async move {
            let _permit = permit;
            let report = session.run().await?;
            let first = store.mark_done(&peer)?;
            Ok::<_, AtlasError>((report, first))
        });

        tracing::info!(
            "Launched session for {} ({} in flight, {} waiting)",
            peer,
            self.scheduler.in_flight(),
            self.store.waiting_len()
        );
        Ok(())
    }

    fn finish(
        &self,
        joined: Result<SessionOutcome, JoinError>,
        summary: &mut CrawlSummary,
    ) -> crate::Result<()> {
        match joined {
            Ok(Ok((report, first))) => {
                summary.crawled += 1;
                summary.discovered += report.discovered;
                if !first {
                    summary.duplicate_completions += 1;
                    tracing::warn!("Duplicate completion for {}", report.peer);
                }
                tracing::info!(
                    "Finished {}: {} peers in {} rounds ({})",
                    report.peer,
                    report.discovered,
                    report.rounds,
                    report.stop_reason
                );
                Ok(())
            }
            Ok(Err(e)) if e.is_fatal() => Err(e),
            Ok(Err(e)) => {
                summary.failed += 1;
                tracing::error!("Session failed: {}", e);
                Ok(())
            }
            Err(e) => {
                summary.failed += 1;
                tracing::error!("Session task failed: {}", e);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::AllowAll;
    use crate::querier::{QueryError, SimulatedNetwork};
    use crate::state::{ClientInfo, CrawlStatus, ProbeKind};
    use crate::storage::CounterKind;
    use async_trait::async_trait;

    fn node(n: u8) -> NodeRecord {
        NodeRecord::new(vec![n; 64], format!("10.0.0.{}:30303", n).parse().unwrap())
    }

    fn quick_config() -> SessionConfig {
        SessionConfig {
            stagnation_limit: 2,
            handshake_probe: false,
            record_probe: false,
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_crawls_to_quiescence() {
        let (a, b, c) = (node(1), node(2), node(3));
        let network = SimulatedNetwork::new().link(&a, &b).link(&b, &c);
        let store = Arc::new(Store::in_memory("2021-09-01").unwrap());

        let coordinator = Coordinator::new(
            store.clone(),
            Arc::new(network),
            Arc::new(AllowAll),
            4,
            quick_config(),
        )
        .with_poll_interval(Duration::from_millis(10))
        .with_purge_on_completion(false);

        assert_eq!(coordinator.seed(&[a.clone()]).unwrap(), 1);
        let summary = coordinator.run().await.unwrap();

        assert_eq!(summary.crawled, 3);
        assert_eq!(summary.purged, None);
        for n in [&a, &b, &c] {
            assert_eq!(store.status(&n.id).unwrap(), CrawlStatus::Done);
        }
        assert!(store.has_edge(&b.id, &c.id).unwrap());
    }

    #[tokio::test]
    async fn test_purges_on_completion() {
        let a = node(1);
        let network = SimulatedNetwork::new().add_peer(a.clone());
        let store = Arc::new(Store::in_memory("2021-09-01").unwrap());

        let coordinator = Coordinator::new(
            store.clone(),
            Arc::new(network),
            Arc::new(AllowAll),
            1,
            quick_config(),
        )
        .with_poll_interval(Duration::from_millis(10));

        coordinator.seed(&[a.clone()]).unwrap();
        let summary = coordinator.run().await.unwrap();

        assert_eq!(summary.crawled, 1);
        assert_eq!(summary.purged, Some(2));
        assert_eq!(store.status(&a.id).unwrap(), CrawlStatus::Waiting);
        assert!(store.has_node(&a.id).unwrap());
    }

    /// Querier whose record lookups hit a descriptor limit
    struct Starved;

    #[async_trait]
    impl Querier for Starved {
        async fn find_related_peers(&self, _: &NodeRecord) -> Result<Vec<NodeRecord>, QueryError> {
            Ok(Vec::new())
        }

        async fn request_record(&self, _: &NodeRecord) -> Result<NodeRecord, QueryError> {
            Err(QueryError::ResourceExhausted("too many open files".to_string()))
        }

        async fn probe(&self, _: &NodeRecord) -> Result<ClientInfo, QueryError> {
            Err(QueryError::Refused("closed".to_string()))
        }
    }

    #[tokio::test]
    async fn test_exhaustion_aborts_without_purge() {
        let a = node(1);
        let store = Arc::new(Store::in_memory("2021-09-01").unwrap());
        let config = SessionConfig {
            record_probe: true,
            ..quick_config()
        };

        let coordinator =
            Coordinator::new(store.clone(), Arc::new(Starved), Arc::new(AllowAll), 1, config)
                .with_poll_interval(Duration::from_millis(10));

        coordinator.seed(&[a.clone()]).unwrap();
        let err = coordinator.run().await.unwrap_err();

        assert!(err.is_fatal());
        assert!(matches!(err, AtlasError::ResourceExhausted { .. }));

        // The peer stays in flight so the next start resumes it
        assert_eq!(store.status(&a.id).unwrap(), CrawlStatus::Doing);
        assert_eq!(store.count(&CounterKind::EpochDone).unwrap(), 0);
        assert_eq!(store.get_raw(b"meta:epoch").unwrap(), Some(b"2021-09-01".to_vec()));
        assert!(!store.has_metadata(&a.id, ProbeKind::ExtendedRecord).unwrap());
    }

    #[test]
    fn test_from_config() {
        let mut config = Config::default();
        config.crawler.threads = 3;
        config.crawler.purge_on_completion = false;
        let store = Arc::new(Store::in_memory("2021-09-01").unwrap());

        let coordinator =
            Coordinator::from_config(&config, store, Arc::new(SimulatedNetwork::new())).unwrap();
        assert_eq!(coordinator.scheduler.capacity(), 3);
        assert!(!coordinator.purge_on_completion);
        assert_eq!(coordinator.poll_interval, Duration::from_millis(3000));
    }
}
