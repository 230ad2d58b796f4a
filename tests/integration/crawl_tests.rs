//! Integration tests for the crawler
//!
//! These tests drive the full crawl cycle end-to-end against an in-memory
//! simulated network, with stores on disk where restarts matter.

use peer_atlas::config::parse_config;
use peer_atlas::crawler::{enrich, Coordinator, SessionConfig};
use peer_atlas::node::{AllowAll, IpBlocklist, NodeRecord, RejectPolicy};
use peer_atlas::output::{load_statistics, query, StatsRequest, StatsResponse, StatsScope};
use peer_atlas::querier::{SimulatedNetwork, Topology};
use peer_atlas::state::{
    ClientInfo, CrawlStatus, MetadataPayload, MetadataStatus, ProbeKind,
};
use peer_atlas::storage::{CounterKind, Store};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const EPOCH: &str = "2021-09-01";

/// Creates a peer with a distinct key and address
fn node(n: u8) -> NodeRecord {
    NodeRecord::new(vec![n; 64], format!("10.0.0.{}:30303", n).parse().unwrap())
}

/// Session tuning that finishes quickly against a small topology
fn quick_session() -> SessionConfig {
    SessionConfig {
        stagnation_limit: 2,
        ..SessionConfig::default()
    }
}

fn coordinator(
    store: &Arc<Store>,
    network: Arc<SimulatedNetwork>,
    reject: Arc<dyn RejectPolicy>,
) -> Coordinator {
    Coordinator::new(store.clone(), network, reject, 4, quick_session())
        .with_poll_interval(Duration::from_millis(10))
        .with_purge_on_completion(false)
}

#[tokio::test]
async fn test_full_crawl_reaches_quiescence() {
    let (a, b, c, d) = (node(1), node(2), node(3), node(4));
    let geth = ClientInfo {
        name: "Geth/v1.10.8".to_string(),
        capabilities: vec!["eth/66".to_string()],
    };
    let network = Arc::new(
        SimulatedNetwork::new()
            .link(&a, &b)
            .link(&a, &c)
            .link(&b, &d)
            .with_client(&a.id, geth.clone()),
    );
    let store = Arc::new(Store::in_memory(EPOCH).unwrap());

    let coordinator = coordinator(&store, network, Arc::new(AllowAll));
    coordinator.seed(&[a.clone()]).unwrap();
    let summary = coordinator.run().await.expect("Crawl failed");

    // Every reachable peer was crawled exactly once
    assert_eq!(summary.crawled, 4);
    assert_eq!(summary.duplicate_completions, 0);
    for n in [&a, &b, &c, &d] {
        assert_eq!(store.status(&n.id).unwrap(), CrawlStatus::Done);
    }

    assert!(store.has_edge(&a.id, &b.id).unwrap());
    assert!(store.has_edge(&a.id, &c.id).unwrap());
    assert!(store.has_edge(&b.id, &d.id).unwrap());
    assert!(!store.has_edge(&c.id, &a.id).unwrap());

    let stats = load_statistics(&store, StatsScope::Today).unwrap();
    assert_eq!(stats.nodes, 4);
    assert_eq!(stats.edges, 3);
    assert_eq!(stats.done, 4);
    assert_eq!(stats.doing, 0);
    assert_eq!(stats.handshakes, 4);
    assert_eq!(stats.records, 4);

    let handshake = store
        .get_metadata(&a.id, ProbeKind::HandshakeInfo)
        .unwrap()
        .unwrap();
    assert_eq!(
        handshake.status,
        MetadataStatus::Success(MetadataPayload::Handshake(geth))
    );

    // Peers without a client refuse the handshake
    let refused = store
        .get_metadata(&d.id, ProbeKind::HandshakeInfo)
        .unwrap()
        .unwrap();
    assert!(matches!(refused.status, MetadataStatus::Failed(_)));

    assert!(
        store.verify_counters().unwrap().is_empty(),
        "Counters diverged after crawl"
    );
}

#[tokio::test]
async fn test_rejected_peer_is_never_queried() {
    let (a, b) = (node(1), node(2));
    let network = Arc::new(SimulatedNetwork::new().link(&a, &b));
    let store = Arc::new(Store::in_memory(EPOCH).unwrap());
    let blocklist = IpBlocklist::new(["10.0.0.2".parse().unwrap()]);

    let coordinator = coordinator(&store, network.clone(), Arc::new(blocklist));
    coordinator.seed(&[a.clone()]).unwrap();
    let summary = coordinator.run().await.unwrap();

    assert_eq!(summary.crawled, 1);
    assert_eq!(summary.rejected, 1);
    assert_eq!(network.discovery_calls(&b.id), 0);

    // Rejected peers are still recorded as discovered, just not crawled
    assert!(store.has_node(&b.id).unwrap());
    assert_eq!(store.status(&b.id).unwrap(), CrawlStatus::Waiting);
}

#[tokio::test]
async fn test_failing_peer_stops_at_error_limit() {
    let (a, b) = (node(1), node(2));
    let network = Arc::new(SimulatedNetwork::new().link(&a, &b).failing(&b.id));
    let store = Arc::new(Store::in_memory(EPOCH).unwrap());

    let coordinator = coordinator(&store, network.clone(), Arc::new(AllowAll));
    coordinator.seed(&[a.clone()]).unwrap();
    let summary = coordinator.run().await.unwrap();

    assert_eq!(summary.crawled, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(network.discovery_calls(&b.id), 5);
    assert_eq!(store.status(&b.id).unwrap(), CrawlStatus::Done);

    let handshake = store
        .get_metadata(&b.id, ProbeKind::HandshakeInfo)
        .unwrap()
        .unwrap();
    assert_eq!(
        handshake.status,
        MetadataStatus::Failed("query timed out".to_string())
    );
}

#[tokio::test]
async fn test_superseding_record_moves_peer() {
    let a = node(1);
    let moved = NodeRecord::new(a.public_key.clone(), "10.1.0.1:30303".parse().unwrap())
        .with_record(7, vec![0xc0, 0xff, 0xee]);
    let network = Arc::new(
        SimulatedNetwork::new()
            .add_peer(a.clone())
            .with_record(&a.id, moved.clone()),
    );
    let store = Arc::new(Store::in_memory(EPOCH).unwrap());

    let coordinator = coordinator(&store, network, Arc::new(AllowAll));
    coordinator.seed(&[a.clone()]).unwrap();
    coordinator.run().await.unwrap();

    let stored = store.get_node(&a.id).unwrap().unwrap();
    assert_eq!(stored.address, moved.address);
    assert_eq!(stored.seq, 7);
    assert_eq!(store.count(&CounterKind::Nodes).unwrap(), 1);
}

#[tokio::test]
async fn test_resume_after_interruption() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("atlas.db");
    let (a, b, c) = (node(1), node(2), node(3));

    // First run is interrupted with c in flight
    {
        let store = Store::open(&db_path, Some(EPOCH)).unwrap();
        for n in [&a, &b, &c] {
            store.put_node(n).unwrap();
        }
        store.mark_doing(&c.id).unwrap();
    }

    // Interrupted peers are queued ahead of never-started ones
    {
        let store = Store::open(&db_path, None).unwrap();
        assert_eq!(store.epoch(), EPOCH);
        assert_eq!(store.next_waiting(), Some(c.id));
        assert_eq!(store.waiting_len(), 2);
    }

    let store = Arc::new(Store::open(&db_path, None).unwrap());
    let network = Arc::new(
        SimulatedNetwork::new()
            .add_peer(a.clone())
            .add_peer(b.clone())
            .add_peer(c.clone()),
    );
    let summary = coordinator(&store, network, Arc::new(AllowAll))
        .run()
        .await
        .unwrap();

    assert_eq!(summary.crawled, 3);
    for n in [&a, &b, &c] {
        assert_eq!(store.status(&n.id).unwrap(), CrawlStatus::Done);
    }
    assert_eq!(store.count(&CounterKind::EpochDone).unwrap(), 3);
}

#[tokio::test]
async fn test_purge_starts_a_fresh_epoch() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("atlas.db");
    let (a, b) = (node(1), node(2));

    {
        let store = Arc::new(Store::open(&db_path, Some(EPOCH)).unwrap());
        let network = Arc::new(SimulatedNetwork::new().link(&a, &b));
        let coordinator = Coordinator::new(
            store.clone(),
            network,
            Arc::new(AllowAll),
            2,
            quick_session(),
        )
        .with_poll_interval(Duration::from_millis(10));

        coordinator.seed(&[a.clone()]).unwrap();
        let summary = coordinator.run().await.unwrap();

        // Two done flags plus the done counter
        assert_eq!(summary.purged, Some(3));
        assert_eq!(store.status(&a.id).unwrap(), CrawlStatus::Waiting);
        assert!(store.has_edge(&a.id, &b.id).unwrap());
    }

    // Nodes and metadata survive; the next open picks a new epoch
    let store = Store::open(&db_path, None).unwrap();
    assert_ne!(store.epoch(), EPOCH);
    assert_eq!(store.count(&CounterKind::Nodes).unwrap(), 2);
    assert_eq!(store.count(&CounterKind::EpochDone).unwrap(), 0);
    assert_eq!(store.waiting_len(), 2);
    assert!(store.has_metadata(&b.id, ProbeKind::ExtendedRecord).unwrap());
}

#[tokio::test]
async fn test_crawl_from_topology_file() {
    let key = |n: u8| hex::encode(vec![n; 64]);
    let topology: Topology = toml::from_str(&format!(
        r#"
        window = 1

        [[peer]]
        address = "enode://{a}@10.0.0.1:30303"
        neighbors = ["enode://{b}@10.0.0.2:30303", "enode://{c}@10.0.0.3:30303"]
        client = "Nethermind/v1.11.0"
        capabilities = ["eth/66", "snap/1"]

        [[peer]]
        address = "enode://{b}@10.0.0.2:30303"
        failing = true
        "#,
        a = key(1),
        b = key(2),
        c = key(3),
    ))
    .unwrap();

    let network = Arc::new(SimulatedNetwork::from_topology(&topology).unwrap());
    assert_eq!(network.peer_count(), 3);

    let config = parse_config(&format!(
        r#"
        [crawler]
        threads = 2
        poll-interval-ms = 10
        stagnation-limit = 3
        purge-on-completion = false

        [seeds]
        nodes = ["enode://{}@10.0.0.1:30303"]
        "#,
        key(1)
    ))
    .unwrap();

    let store = Arc::new(Store::in_memory(EPOCH).unwrap());
    let coordinator = Coordinator::from_config(&config, store.clone(), network.clone()).unwrap();
    coordinator.seed(&config.seed_nodes().unwrap()).unwrap();
    let summary = coordinator.run().await.unwrap();

    // A window of one still surfaces both neighbors over successive calls
    assert_eq!(summary.crawled, 3);
    assert_eq!(store.edges_from(&node(1).id).unwrap().len(), 2);
    assert_eq!(store.count(&CounterKind::Edges).unwrap(), 2);
    assert!(store.verify_counters().unwrap().is_empty());
}

#[tokio::test]
async fn test_query_reads_store_without_server() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("atlas.db");
    let (a, b) = (node(1), node(2));

    {
        let store = Arc::new(Store::open(&db_path, Some(EPOCH)).unwrap());
        let network = Arc::new(SimulatedNetwork::new().link(&a, &b));
        let coordinator = coordinator(&store, network, Arc::new(AllowAll));
        coordinator.seed(&[a.clone()]).unwrap();
        coordinator.run().await.unwrap();
    }

    let socket = dir.path().join("atlas.sock");
    let response = query(&socket, StatsRequest::Lifetime, || {
        Ok(Store::open_read_only(&db_path)?)
    })
    .await
    .unwrap();

    match response {
        StatsResponse::Statistics(stats) => {
            assert_eq!(stats.scope, StatsScope::Lifetime);
            assert_eq!(stats.nodes, 2);
            assert_eq!(stats.edges, 1);
            assert_eq!(stats.done, 2);
        }
        other => panic!("Unexpected response: {:?}", other),
    }
}

#[tokio::test]
async fn test_query_after_purge_leaves_store_untouched() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("atlas.db");
    let (a, b) = (node(1), node(2));

    {
        let store = Arc::new(Store::open(&db_path, Some(EPOCH)).unwrap());
        let network = Arc::new(SimulatedNetwork::new().link(&a, &b));
        let coordinator = Coordinator::new(store, network, Arc::new(AllowAll), 2, quick_session())
            .with_poll_interval(Duration::from_millis(10));
        coordinator.seed(&[a.clone()]).unwrap();
        coordinator.run().await.unwrap();
    }

    // A running crawl holds the writer lock; stats still come from the file
    let crawl = Store::open(&db_path, Some("2021-09-02")).unwrap();
    let socket = dir.path().join("atlas.sock");
    let response = query(&socket, StatsRequest::Today, || {
        Ok(Store::open_read_only(&db_path)?)
    })
    .await
    .unwrap();
    drop(crawl);

    match response {
        StatsResponse::Statistics(stats) => {
            assert_eq!(stats.scope, StatsScope::Today);
            assert_eq!(stats.done, 0);
        }
        other => panic!("Unexpected response: {:?}", other),
    }

    // The epoch is the one the crawl chose, not one the query invented
    let store = Store::open(&db_path, None).unwrap();
    assert_eq!(store.epoch(), "2021-09-02");
}

#[tokio::test]
async fn test_enrich_covers_rejected_peers() {
    let (a, b) = (node(1), node(2));
    let geth = ClientInfo {
        name: "Geth/v1.10.8".to_string(),
        capabilities: vec!["eth/66".to_string()],
    };
    let network = Arc::new(
        SimulatedNetwork::new()
            .link(&a, &b)
            .with_client(&b.id, geth.clone()),
    );
    let store = Arc::new(Store::in_memory(EPOCH).unwrap());

    let blocklist = IpBlocklist::new(["10.0.0.2".parse().unwrap()]);
    let coordinator = Coordinator::new(
        store.clone(),
        network.clone(),
        Arc::new(blocklist),
        2,
        quick_session(),
    )
    .with_poll_interval(Duration::from_millis(10))
    .with_purge_on_completion(false);
    coordinator.seed(&[a.clone()]).unwrap();
    let summary = coordinator.run().await.unwrap();
    assert_eq!(summary.rejected, 1);
    assert!(!store.has_metadata(&b.id, ProbeKind::HandshakeInfo).unwrap());

    let enriched = enrich(
        store.clone(),
        network,
        ProbeKind::HandshakeInfo,
        4,
        &quick_session(),
    )
    .await
    .unwrap();

    assert_eq!(enriched.probed, 1);
    assert_eq!(enriched.skipped, 1);
    let info = store
        .get_metadata(&b.id, ProbeKind::HandshakeInfo)
        .unwrap()
        .unwrap();
    assert_eq!(info.status, MetadataStatus::Success(MetadataPayload::Handshake(geth)));
    assert_eq!(store.status(&b.id).unwrap(), CrawlStatus::Waiting);
}
