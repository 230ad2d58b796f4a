//! Metadata enrichment over every stored peer
//!
//! Walks the node table page by page and runs one metadata probe kind
//! against each peer that has no result for it yet, regardless of crawl
//! status. Peers the reject policy skipped, or that were only ever seen as
//! neighbors, get metadata this way.

use crate::crawler::probe::MetadataProber;
use crate::crawler::session::SessionConfig;
use crate::querier::Querier;
use crate::state::ProbeKind;
use crate::storage::Store;
use crate::AtlasError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

const NODE_PAGE_SIZE: usize = 256;

/// Totals for one enrichment pass
#[derive(Debug, Clone, Default)]
pub struct EnrichSummary {
    /// Peers that were probed
    pub probed: usize,

    /// Peers that already had a result for the kind
    pub skipped: usize,

    /// Probe tasks that ended in a non-fatal error or panicked
    pub failed: usize,

    pub elapsed: Duration,
}

/// Runs the `kind` probe against every stored peer without a result
///
/// At most `threads` probes run at once. A fatal error aborts the
/// remaining probes and is returned; results stored so far are kept and a
/// rerun continues with the peers still missing.
pub async fn enrich(
    store: Arc<Store>,
    querier: Arc<dyn Querier>,
    kind: ProbeKind,
    threads: usize,
    config: &SessionConfig,
) -> crate::Result<EnrichSummary> {
    let started = Instant::now();
    let permits = Arc::new(Semaphore::new(threads.max(1)));
    let config = SessionConfig {
        handshake_probe: kind == ProbeKind::HandshakeInfo,
        record_probe: kind == ProbeKind::ExtendedRecord,
        ..config.clone()
    };

    let mut probes = JoinSet::new();
    let mut summary = EnrichSummary::default();
    let mut cursor = store.nodes_cursor();

    tracing::info!("Enriching {} metadata with {} probes max", kind, threads.max(1));

    let outcome = async {
        loop {
            let page = store.next_nodes(&mut cursor, NODE_PAGE_SIZE)?;
            if page.is_empty() {
                break;
            }

            for node in page {
                if store.has_metadata(&node.id, kind)? {
                    summary.skipped += 1;
                    continue;
                }

                let permit = Arc::clone(&permits)
                    .acquire_owned()
                    .await
                    .map_err(|_| AtlasError::Shutdown)?;
                let prober = MetadataProber::new(
                    node,
                    Arc::clone(&store),
                    Arc::clone(&querier),
                    &config,
                );
                probes.spawn(async move {
                    let _permit = permit;
                    prober.run().await
                });
                summary.probed += 1;

                while let Some(joined) = probes.try_join_next() {
                    settle(joined, &mut summary)?;
                }
            }
        }

        while let Some(joined) = probes.join_next().await {
            settle(joined, &mut summary)?;
        }
        Ok::<(), AtlasError>(())
    }
    .await;

    if let Err(e) = outcome {
        tracing::error!("Stopping enrichment: {}", e);
        probes.abort_all();
        return Err(e);
    }

    summary.elapsed = started.elapsed();
    tracing::info!(
        "Enrichment complete: {} probed, {} already known, {} failed in {:.1}s",
        summary.probed,
        summary.skipped,
        summary.failed,
        summary.elapsed.as_secs_f64()
    );
    Ok(summary)
}

fn settle(
    joined: Result<crate::Result<()>, tokio::task::JoinError>,
    summary: &mut EnrichSummary,
) -> crate::Result<()> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) if e.is_fatal() => Err(e),
        Ok(Err(e)) => {
            summary.failed += 1;
            tracing::error!("Probe failed: {}", e);
            Ok(())
        }
        Err(e) => {
            summary.failed += 1;
            tracing::error!("Probe task failed: {}", e);
            Ok(())
        }
    }
}
