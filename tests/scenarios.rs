//! End-to-end scenarios against the public fabric surface.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use econ_fabric::admission::{Admission, DegradationLevel};
use econ_fabric::config::{BreakerConfig, FabricConfig};
use econ_fabric::edge::{DistributeOptions, EdgeDistribution, EdgeSettings, FetchSource};
use econ_fabric::error::{FabricError, FabricResult};
use econ_fabric::models::{Request, RequestOrigin, RequestType};
use econ_fabric::orchestrator::{Orchestrator, Outcome, RequestHandler, StaticProbe};
use econ_fabric::server::{self, AppState};
use econ_fabric::store::{ReadMode, ShardedStore, StoreSettings};

fn test_config() -> FabricConfig {
    let mut config = FabricConfig::default();
    config.shard_count = 4;
    config.ddos_enabled = false;
    config
}

fn orchestrator(config: FabricConfig) -> Orchestrator {
    Orchestrator::new(config).with_probe(Arc::new(StaticProbe::default()))
}

fn origin() -> RequestOrigin {
    RequestOrigin::anonymous(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)))
}

async fn spawn_server(config: FabricConfig) -> (SocketAddr, Arc<Orchestrator>, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let orchestrator = Arc::new(orchestrator(config));
    let cancel = CancellationToken::new();
    orchestrator.start(&cancel);
    let state = AppState::new(orchestrator.clone(), None);
    tokio::spawn(server::serve(listener, state, cancel.clone()));
    (addr, orchestrator, cancel)
}

async fn next_json<S>(ws: &mut S) -> Value
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("socket ended: {:?}", other),
        }
    }
}

#[tokio::test]
async fn s1_ping_gets_pong_within_50ms() {
    let (addr, orchestrator, cancel) = spawn_server(test_config()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .unwrap();

    let ack = next_json(&mut ws).await;
    assert_eq!(ack["type"], "connection_ack");
    assert!(ack["connectionId"].is_string());
    assert!(ack["shardId"].as_u64().unwrap() < 4);
    assert!(ack["timestamp"].is_i64());

    let sent = Instant::now();
    ws.send(Message::Text(json!({"type": "ping"}).to_string()))
        .await
        .unwrap();
    let pong = tokio::time::timeout(Duration::from_millis(50), next_json(&mut ws))
        .await
        .expect("pong within 50 ms");
    assert!(sent.elapsed() < Duration::from_millis(50));
    assert_eq!(pong["type"], "pong");
    assert!(pong["timestamp"].is_i64());

    ws.send(Message::Text(
        json!({"type": "analytics", "payload": {}, "requestId": "r-1"}).to_string(),
    ))
    .await
    .unwrap();
    let response = next_json(&mut ws).await;
    assert_eq!(response["type"], "response");
    assert_eq!(response["requestId"], "r-1");
    assert_eq!(response["success"], true);
    assert_eq!(orchestrator.registry().active(), 1);

    ws.close(None).await.unwrap();
    cancel.cancel();
}

#[tokio::test]
async fn s1_malformed_frame_is_rejected_with_400() {
    let (addr, _orchestrator, cancel) = spawn_server(test_config()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .unwrap();
    let _ack = next_json(&mut ws).await;

    ws.send(Message::Text("{not json".into())).await.unwrap();
    let rejected = next_json(&mut ws).await;
    assert_eq!(rejected["type"], "rejected");
    assert_eq!(rejected["code"], 400);
    assert_eq!(rejected["retry_after_ms"], 0);
    cancel.cancel();
}

#[tokio::test]
async fn s2_global_window_admits_twenty_then_429() {
    let mut config = test_config();
    config.limits.global_request_limit = 20;
    config.limits.global_request_window_ms = 1_000;
    let o = orchestrator(config);

    let mut admitted = 0;
    let mut rejected = Vec::new();
    for _ in 0..25 {
        let request = Request::new(RequestType::Analytics, json!({}));
        match o.submit_request(request, origin()).await {
            Outcome::Response(_) => admitted += 1,
            Outcome::Rejected(err) => rejected.push(err),
            Outcome::Queued { .. } => panic!("unexpected queueing at zero load"),
        }
    }
    assert_eq!(admitted, 20);
    assert_eq!(rejected.len(), 5);
    for err in rejected {
        assert_eq!(err.code(), 429);
        let retry = err.retry_after_ms();
        assert!((500..=1500).contains(&retry), "retry_after_ms {}", retry);
    }
}

struct FailingHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl RequestHandler for FailingHandler {
    async fn handle(&self, _request: &Request, _origin: &RequestOrigin) -> FabricResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(FabricError::Timeout("settlement"))
    }
}

#[tokio::test]
async fn s3_breaker_opens_after_five_failures_then_probes() {
    let mut config = test_config();
    config.breaker = BreakerConfig {
        failure_threshold: 5,
        open_ms: 30_000,
        success_threshold: 3,
    };
    let handler = Arc::new(FailingHandler {
        calls: AtomicUsize::new(0),
    });
    let o = orchestrator(config).with_handler(handler.clone());
    let trade = || Request::new(RequestType::TradeExecution, json!({}));

    for _ in 0..5 {
        match o.submit_request(trade(), origin()).await {
            Outcome::Rejected(err) => assert_eq!(err.code(), 503),
            other => panic!("expected failure, got {:?}", other),
        }
    }
    assert_eq!(handler.calls.load(Ordering::SeqCst), 5);

    match o.submit_request(trade(), origin()).await {
        Outcome::Rejected(err) => {
            assert_eq!(err.code(), 503);
            assert_eq!(err.reason(), "circuit_open");
        }
        other => panic!("expected circuit_open, got {:?}", other),
    }
    assert_eq!(handler.calls.load(Ordering::SeqCst), 5);

    let later = Instant::now() + Duration::from_secs(30);
    match o.admission().admit_at(trade(), origin(), later) {
        Admission::Admitted(a) => assert!(a.probe),
        other => panic!("expected a probe, got {:?}", other),
    }
}

#[tokio::test]
async fn s4_emergency_gate() {
    let o = orchestrator(test_config());
    o.force_degradation(Some(DegradationLevel::Emergency));

    match o
        .submit_request(Request::new(RequestType::Analytics, json!({})), origin())
        .await
    {
        Outcome::Rejected(err) => assert_eq!(err.code(), 503),
        other => panic!("expected 503, got {:?}", other),
    }
    assert!(matches!(
        o.submit_request(Request::new(RequestType::TradeExecution, json!({})), origin())
            .await,
        Outcome::Response(_)
    ));

    o.force_degradation(None);
    assert!(matches!(
        o.submit_request(Request::new(RequestType::Analytics, json!({})), origin())
            .await,
        Outcome::Response(_)
    ));
}

#[tokio::test]
async fn s5_shard_rebalance_is_bounded_and_readable() {
    let store = ShardedStore::new(StoreSettings {
        shard_count: 4,
        replication_factor: 3,
        virtual_nodes: 128,
        write_timeout: Duration::from_millis(250),
        read_timeout: Duration::from_millis(100),
    });
    let keys: Vec<String> = (0..10_000).map(|i| format!("agent:{}", i)).collect();
    let mut versions = Vec::with_capacity(keys.len());
    for (i, key) in keys.iter().enumerate() {
        versions.push(store.set(key, Bytes::from(format!("state-{}", i))).await.unwrap());
    }

    let mut migration = store.begin_add_shard(4).unwrap();
    assert!(migration.remaining() <= 2_000);
    let mut steps = 0;
    while !store.step(&mut migration, 250).unwrap() {
        steps += 1;
        for key in keys.iter().step_by(37) {
            assert!(store.get(key).await.unwrap().is_some(), "{} unreadable mid-migration", key);
        }
    }
    assert!(steps > 0);
    assert!(migration.moved() <= 2_000, "moved {}", migration.moved());
    assert_eq!(store.shard_ids().len(), 5);

    for (i, key) in keys.iter().enumerate() {
        let read = store
            .get_versioned(key, ReadMode::Primary)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.version, versions[i]);
        assert_eq!(read.value, Some(Bytes::from(format!("state-{}", i))));
    }
}

#[tokio::test]
async fn s6_edge_invalidation() {
    let edge = EdgeDistribution::new(EdgeSettings::default());
    let regions = edge.regions();

    edge.distribute("market:grain", Bytes::from_static(b"v1"), &DistributeOptions::push_all())
        .unwrap();
    for region in &regions {
        let hit = edge.fetch("market:grain", region).await.unwrap().unwrap();
        assert_eq!(hit.payload, Bytes::from_static(b"v1"));
        assert_eq!(hit.source, FetchSource::Edge);
    }

    let floor = edge.invalidate("market:grain");
    for region in &regions {
        assert_eq!(edge.node(region).unwrap().cached_version("market:grain"), None);
    }

    let report = edge
        .distribute("market:grain", Bytes::from_static(b"v2"), &DistributeOptions::push_all())
        .unwrap();
    assert!(report.version > floor);
    for region in &regions {
        let hit = edge.fetch("market:grain", region).await.unwrap().unwrap();
        assert_eq!(hit.payload, Bytes::from_static(b"v2"));
        assert_eq!(hit.version, report.version);
    }
}

#[tokio::test]
async fn public_writes_follow_store_versions_to_every_edge() {
    let o = orchestrator(test_config());
    for i in 1..=3u64 {
        let version = o
            .write_state("public:price", Bytes::from(format!("p{}", i)))
            .await
            .unwrap();
        assert_eq!(version, i);
    }
    for region in o.edge().unwrap().regions() {
        let hit = o.fetch("public:price", &region).await.unwrap().unwrap();
        assert_eq!(hit.version, 3);
        assert_eq!(hit.payload, Bytes::from_static(b"p3"));
    }
}
