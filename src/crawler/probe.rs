//! Metadata probes run alongside a session's round loop
//!
//! Each probe kind is issued at most once per peer and only if no result is
//! stored yet. The handshake gets a single attempt; the record lookup is
//! retried up to its attempt budget. Failures are stored as `Failed` records
//! so the peer is not probed again.

use crate::crawler::session::SessionConfig;
use crate::node::NodeRecord;
use crate::querier::{Querier, QueryError};
use crate::state::{MetadataPayload, MetadataStatus, ProbeKind};
use crate::storage::Store;
use crate::AtlasError;
use std::sync::Arc;

pub struct MetadataProber {
    target: NodeRecord,
    store: Arc<Store>,
    querier: Arc<dyn Querier>,
    handshake: bool,
    record: bool,
    record_attempts: u32,
}

impl MetadataProber {
    pub fn new(
        target: NodeRecord,
        store: Arc<Store>,
        querier: Arc<dyn Querier>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            target,
            store,
            querier,
            handshake: config.handshake_probe,
            record: config.record_probe,
            record_attempts: config.record_attempts.max(1),
        }
    }

    /// Runs every enabled probe that has no stored result
    pub async fn run(&self) -> crate::Result<()> {
        tokio::try_join!(self.probe_handshake(), self.probe_record())?;
        Ok(())
    }

    async fn probe_handshake(&self) -> crate::Result<()> {
        let kind = ProbeKind::HandshakeInfo;
        if !self.handshake || self.store.has_metadata(&self.target.id, kind)? {
            return Ok(());
        }

        let status = match self.querier.probe(&self.target).await {
            Ok(info) => {
                tracing::debug!("{} runs {}", self.target.id, info);
                MetadataStatus::Success(MetadataPayload::Handshake(info))
            }
            Err(e) => self.failed(kind, e)?,
        };

        self.store.put_metadata(&self.target.id, kind, status)?;
        Ok(())
    }

    async fn probe_record(&self) -> crate::Result<()> {
        let kind = ProbeKind::ExtendedRecord;
        if !self.record || self.store.has_metadata(&self.target.id, kind)? {
            return Ok(());
        }

        let mut last_error = QueryError::Timeout;
        for attempt in 1..=self.record_attempts {
            match self.querier.request_record(&self.target).await {
                Ok(record) if record.id == self.target.id => {
                    self.store.put_metadata(
                        &self.target.id,
                        kind,
                        MetadataStatus::Success(MetadataPayload::Record(record)),
                    )?;
                    return Ok(());
                }
                Ok(record) => {
                    last_error = QueryError::Malformed(format!(
                        "record for {} returned by {}",
                        record.id, self.target.id
                    ));
                }
                Err(e) if e.is_fatal() => return Err(self.exhausted(e)),
                Err(e) => last_error = e,
            }
            tracing::trace!(
                "Record lookup {}/{} for {} failed: {}",
                attempt,
                self.record_attempts,
                self.target.id,
                last_error
            );
        }

        let status = self.failed(kind, last_error)?;
        self.store.put_metadata(&self.target.id, kind, status)?;
        Ok(())
    }

    fn failed(&self, kind: ProbeKind, error: QueryError) -> crate::Result<MetadataStatus> {
        if error.is_fatal() {
            return Err(self.exhausted(error));
        }
        tracing::debug!("{} probe of {} failed: {}", kind, self.target.id, error);
        Ok(MetadataStatus::Failed(error.summary()))
    }

    fn exhausted(&self, error: QueryError) -> AtlasError {
        AtlasError::ResourceExhausted {
            peer: self.target.to_url(),
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::PeerId;
    use crate::querier::SimulatedNetwork;
    use crate::state::ClientInfo;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn node(n: u8) -> NodeRecord {
        NodeRecord::new(vec![n; 64], format!("10.0.0.{}:30303", n).parse().unwrap())
    }

    /// Querier whose probes fail in a configurable way
    struct Flaky {
        record_calls: AtomicUsize,
        record_error: fn() -> QueryError,
    }

    #[async_trait]
    impl Querier for Flaky {
        async fn find_related_peers(&self, _: &NodeRecord) -> Result<Vec<NodeRecord>, QueryError> {
            Ok(Vec::new())
        }

        async fn request_record(&self, _: &NodeRecord) -> Result<NodeRecord, QueryError> {
            self.record_calls.fetch_add(1, Ordering::SeqCst);
            Err((self.record_error)())
        }

        async fn probe(&self, _: &NodeRecord) -> Result<ClientInfo, QueryError> {
            Err(QueryError::Refused("closed".to_string()))
        }
    }

    fn prober(target: &NodeRecord, store: &Arc<Store>, querier: Arc<dyn Querier>) -> MetadataProber {
        MetadataProber::new(target.clone(), store.clone(), querier, &SessionConfig::default())
    }

    #[tokio::test]
    async fn test_successful_probes_are_stored() {
        let a = node(1);
        let info = ClientInfo {
            name: "Geth/v1.10.8".to_string(),
            capabilities: vec!["eth/66".to_string()],
        };
        let network = SimulatedNetwork::new()
            .add_peer(a.clone())
            .with_client(&a.id, info.clone());
        let store = Arc::new(Store::in_memory("2021-09-01").unwrap());

        prober(&a, &store, Arc::new(network)).run().await.unwrap();

        let handshake = store
            .get_metadata(&a.id, ProbeKind::HandshakeInfo)
            .unwrap()
            .unwrap();
        assert_eq!(
            handshake.status,
            MetadataStatus::Success(MetadataPayload::Handshake(info))
        );
        assert!(store.has_metadata(&a.id, ProbeKind::ExtendedRecord).unwrap());
    }

    #[tokio::test]
    async fn test_record_retries_then_fails() {
        let a = node(1);
        let flaky = Arc::new(Flaky {
            record_calls: AtomicUsize::new(0),
            record_error: || QueryError::Timeout,
        });
        let store = Arc::new(Store::in_memory("2021-09-01").unwrap());

        prober(&a, &store, flaky.clone()).run().await.unwrap();

        assert_eq!(flaky.record_calls.load(Ordering::SeqCst), 3);
        let record = store
            .get_metadata(&a.id, ProbeKind::ExtendedRecord)
            .unwrap()
            .unwrap();
        assert_eq!(record.status, MetadataStatus::Failed("query timed out".to_string()));

        let handshake = store
            .get_metadata(&a.id, ProbeKind::HandshakeInfo)
            .unwrap()
            .unwrap();
        assert!(!handshake.status.is_success());
    }

    #[tokio::test]
    async fn test_existing_metadata_is_not_probed_again() {
        let a = node(1);
        let flaky = Arc::new(Flaky {
            record_calls: AtomicUsize::new(0),
            record_error: || QueryError::Timeout,
        });
        let store = Arc::new(Store::in_memory("2021-09-01").unwrap());
        store
            .put_metadata(&a.id, ProbeKind::ExtendedRecord, MetadataStatus::Unqueried)
            .unwrap();

        prober(&a, &store, flaky.clone()).run().await.unwrap();
        assert_eq!(flaky.record_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_is_fatal() {
        let a = node(1);
        let flaky = Arc::new(Flaky {
            record_calls: AtomicUsize::new(0),
            record_error: || QueryError::ResourceExhausted("too many open files".to_string()),
        });
        let store = Arc::new(Store::in_memory("2021-09-01").unwrap());

        let err = prober(&a, &store, flaky.clone()).run().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, AtlasError::ResourceExhausted { .. }));
        assert_eq!(flaky.record_calls.load(Ordering::SeqCst), 1);
        assert!(!store.has_metadata(&a.id, ProbeKind::ExtendedRecord).unwrap());
    }

    #[tokio::test]
    async fn test_foreign_record_is_rejected() {
        let (a, b) = (node(1), node(2));
        let network = SimulatedNetwork::new()
            .add_peer(a.clone())
            .with_record(&a.id, b.clone());
        let store = Arc::new(Store::in_memory("2021-09-01").unwrap());

        prober(&a, &store, Arc::new(network)).run().await.unwrap();

        let record = store
            .get_metadata(&a.id, ProbeKind::ExtendedRecord)
            .unwrap()
            .unwrap();
        assert!(matches!(record.status, MetadataStatus::Failed(_)));
        assert!(!store.has_node(&PeerId::from_public_key(&b.public_key)).unwrap());
    }
}
