//! Orchestrator
//!
//! Owns the wiring between sessions, admission, the store, the edges and
//! compute, and exposes one surface over them. Ticker tasks (heartbeat,
//! queue drain, adaptive scaling, metrics, report, scaling advice) are
//! started from here and stop on the shared cancellation token.

pub mod metrics;

pub use self::metrics::{
    recommend, MetricsSnapshot, PerformanceReport, ScalingAction, ScalingRecommendation,
    StaticProbe, SysinfoProbe, SystemProbe,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::scheduler::{self, Dispatcher, ADAPTIVE_SCALING_PERIOD};
use crate::admission::{
    Admission, AdmissionPipeline, DegradationLevel, LoadMonitor, LoadSample, PriorityClass,
    QueuedRequest,
};
use crate::compute::{ComputeOutput, ComputeRouter, Workload};
use crate::config::FabricConfig;
use crate::edge::{DistributeOptions, DistributionReport, EdgeDistribution, EdgeSettings, Fetched};
use crate::error::{FabricError, FabricResult};
use crate::latency::LatencySummary;
use crate::models::{Request, RequestOrigin, RequestType, ServerFrame};
use crate::session::{self, SessionEvent, SessionRegistry};
use crate::store::{ShardedStore, StoreSettings};

pub const METRICS_PERIOD: Duration = Duration::from_secs(1);
pub const REPORT_PERIOD: Duration = Duration::from_secs(60);
pub const SCALING_PERIOD: Duration = Duration::from_secs(30);
/// Deadline for one dispatched request.
pub const DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);

const SNAPSHOT_CHANNEL_CAPACITY: usize = 64;

/// Key prefixes whose writes are also published to the edges.
pub const DEFAULT_PUBLIC_PREFIXES: &[&str] = &["market:", "public:"];

pub fn agent_key(id: &str) -> String {
    format!("agent:{}", id)
}

/// Domain work for requests the orchestrator does not handle itself.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: &Request, origin: &RequestOrigin) -> FabricResult<Value>;
}

/// Acknowledges every request.
#[derive(Debug, Default)]
pub struct AcknowledgeHandler;

#[async_trait]
impl RequestHandler for AcknowledgeHandler {
    async fn handle(&self, request: &Request, _origin: &RequestOrigin) -> FabricResult<Value> {
        Ok(json!({ "acknowledged": true, "type": request.kind.as_str() }))
    }
}

/// Result of `submit_request`.
#[derive(Debug)]
pub enum Outcome {
    Response(Value),
    Queued {
        class: PriorityClass,
        estimated_wait: Duration,
    },
    Rejected(FabricError),
}

impl Outcome {
    pub fn into_frame(self, request_id: Option<String>) -> ServerFrame {
        match self {
            Outcome::Response(data) => ServerFrame::Response {
                request_id,
                success: true,
                data,
            },
            Outcome::Queued {
                class,
                estimated_wait,
            } => ServerFrame::Queued {
                request_id,
                queue: class.as_str().to_string(),
                estimated_wait_ms: estimated_wait.as_millis() as u64,
            },
            Outcome::Rejected(err) => ServerFrame::Rejected {
                request_id,
                rejection: err.into_rejection(),
            },
        }
    }
}

pub struct Orchestrator {
    config: FabricConfig,
    started_at: Instant,
    registry: Arc<SessionRegistry>,
    admission: Arc<AdmissionPipeline>,
    store: Arc<ShardedStore>,
    edge: Option<Arc<EdgeDistribution>>,
    compute: ComputeRouter,
    handler: Arc<dyn RequestHandler>,
    probe: Arc<dyn SystemProbe>,
    public_prefixes: Vec<String>,
    snapshots: broadcast::Sender<MetricsSnapshot>,
    latest: RwLock<Option<MetricsSnapshot>>,
    /// Worst per-second p95 since the last scaling recommendation.
    peak_p95_ms: Mutex<f64>,
}

impl Orchestrator {
    pub fn new(config: FabricConfig) -> Self {
        let load = Arc::new(LoadMonitor::new());
        let registry = Arc::new(SessionRegistry::new(
            config.max_connections,
            config.egress_buffer_frames,
        ));
        let admission = Arc::new(AdmissionPipeline::new(&config, load));
        let store = Arc::new(ShardedStore::new(StoreSettings::from_config(&config)));
        let edge = config
            .enable_edge
            .then(|| Arc::new(EdgeDistribution::new(EdgeSettings::from_config(&config))));
        let compute = ComputeRouter::from_config(&config);
        let (snapshots, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        info!(
            shards = config.shard_count,
            replication = config.replication_factor,
            max_connections = config.max_connections,
            edge = config.enable_edge,
            admission = config.enable_admission,
            "Orchestrator initialized"
        );
        Self {
            config,
            started_at: Instant::now(),
            registry,
            admission,
            store,
            edge,
            compute,
            handler: Arc::new(AcknowledgeHandler),
            probe: Arc::new(SysinfoProbe::new()),
            public_prefixes: DEFAULT_PUBLIC_PREFIXES.iter().map(|p| p.to_string()).collect(),
            snapshots,
            latest: RwLock::new(None),
            peak_p95_ms: Mutex::new(0.0),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn SystemProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_compute(mut self, compute: ComputeRouter) -> Self {
        self.compute = compute;
        self
    }

    pub fn with_public_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.public_prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn admission(&self) -> &Arc<AdmissionPipeline> {
        &self.admission
    }

    pub fn store(&self) -> &Arc<ShardedStore> {
        &self.store
    }

    pub fn edge(&self) -> Option<&Arc<EdgeDistribution>> {
        self.edge.as_ref()
    }

    fn edge_or_err(&self) -> FabricResult<&Arc<EdgeDistribution>> {
        self.edge
            .as_ref()
            .ok_or_else(|| FabricError::unavailable("edge_disabled"))
    }

    /// Shard affinity of a remote address; stable for a fixed shard count.
    pub fn session_shard(&self, remote: IpAddr) -> u32 {
        self.store
            .shard_of(&format!("session:{}", remote))
            .unwrap_or(0)
    }

    pub fn is_public(&self, key: &str) -> bool {
        self.public_prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }

    // ---- admission surface ----

    pub fn admit_connection(&self, origin: &RequestOrigin) -> FabricResult<()> {
        self.admission.admit_connection_at(origin, Instant::now())
    }

    pub async fn submit_request(&self, request: Request, origin: RequestOrigin) -> Outcome {
        match self.admission.admit(request, origin) {
            Admission::Admitted(admitted) => {
                match self.dispatch_request(&admitted.request, &admitted.origin).await {
                    Ok(data) => Outcome::Response(data),
                    Err(err) => Outcome::Rejected(err),
                }
            }
            Admission::Queued {
                class,
                estimated_wait,
            } => Outcome::Queued {
                class,
                estimated_wait,
            },
            Admission::Rejected(err) => Outcome::Rejected(err),
        }
    }

    /// Execute an admitted request under the dispatch deadline and feed the
    /// result back into breakers and latency tracking.
    async fn dispatch_request(&self, request: &Request, origin: &RequestOrigin) -> FabricResult<Value> {
        let result = tokio::time::timeout(DISPATCH_TIMEOUT, self.execute(request, origin))
            .await
            .unwrap_or(Err(FabricError::Timeout("dispatch")));
        let latency = request.arrived_at.elapsed();
        self.admission.record_outcome(request.kind, &result, latency);
        if let Err(err) = &result {
            if let FabricError::Internal(msg) = err {
                warn!(kind = request.kind.as_str(), error = %msg, "Dispatch failed");
            } else {
                debug!(kind = request.kind.as_str(), reason = err.reason(), "Dispatch failed");
            }
        }
        result
    }

    async fn execute(&self, request: &Request, origin: &RequestOrigin) -> FabricResult<Value> {
        if request.kind == RequestType::AgentUpdate {
            if let Some(write) = StateWrite::from_payload(&request.payload)? {
                let version = self.write_state(&write.key, write.value).await?;
                return Ok(json!({ "key": write.key, "version": version }));
            }
        }
        self.handler.handle(request, origin).await
    }

    // ---- store surface ----

    /// Write `key`; public keys are then pushed to every edge at the store
    /// version. The store write is the commit point: a failed push is logged
    /// and edges catch up on their next origin fetch.
    pub async fn write_state(&self, key: &str, value: Bytes) -> FabricResult<u64> {
        let version = self.store.set(key, value.clone()).await?;
        if self.is_public(key) {
            if let Some(edge) = &self.edge {
                let options = DistributeOptions::push_all().with_version(version);
                if let Err(e) = edge.distribute(key, value, &options) {
                    warn!(key, version, error = %e, "Edge push failed after store commit");
                }
            }
        }
        Ok(version)
    }

    pub async fn store_agent(&self, id: &str, state: &Value) -> FabricResult<u64> {
        let bytes = serde_json::to_vec(state)
            .map_err(|e| FabricError::BadRequest(format!("agent state: {}", e)))?;
        self.write_state(&agent_key(id), Bytes::from(bytes)).await
    }

    pub async fn load_agent(&self, id: &str) -> FabricResult<Option<Value>> {
        match self.store.get(&agent_key(id)).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| FabricError::Internal(format!("stored agent {} is not JSON: {}", id, e))),
            None => Ok(None),
        }
    }

    // ---- edge surface ----

    pub fn distribute(&self, key: &str, payload: Bytes, options: &DistributeOptions) -> FabricResult<DistributionReport> {
        self.edge_or_err()?.distribute(key, payload, options)
    }

    pub fn invalidate(&self, key: &str) -> FabricResult<u64> {
        Ok(self.edge_or_err()?.invalidate(key))
    }

    /// Fetch from `region`, steered to a healthy edge if it is degraded.
    pub async fn fetch(&self, key: &str, region: &str) -> FabricResult<Option<Fetched>> {
        let edge = self.edge_or_err()?;
        let region = edge
            .healthy_region(region)
            .unwrap_or_else(|| region.to_string());
        edge.fetch(key, &region).await
    }

    // ---- compute surface ----

    pub async fn run_compute(&self, workload: Workload) -> FabricResult<ComputeOutput> {
        self.compute.run(workload).await
    }

    // ---- operator controls ----

    pub fn force_degradation(&self, level: Option<DegradationLevel>) {
        self.admission.set_degradation_override(level);
    }

    pub fn force_breaker_open(&self, endpoint: &str) {
        self.admission.breakers().force_open(endpoint);
    }

    // ---- metrics ----

    pub fn subscribe_metrics(&self) -> broadcast::Receiver<MetricsSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn latest_snapshot(&self) -> Option<MetricsSnapshot> {
        self.latest.read().clone()
    }

    fn build_snapshot(&self, cpu: f64, memory: f64, latency: LatencySummary) -> MetricsSnapshot {
        let load = self.admission.load_monitor();
        MetricsSnapshot {
            timestamp: chrono::Utc::now().timestamp_millis(),
            uptime_secs: self.started_at.elapsed().as_secs_f64(),
            load: load.load(),
            level: load.level(),
            cpu,
            memory,
            connection_utilization: self.registry.active() as f64
                / self.registry.max_sessions().max(1) as f64,
            latency,
            sessions: self.registry.stats(),
            admission: self.admission.stats(),
            queues: self.admission.queues().snapshot(),
            store: self.store.stats(),
            edges: self.edge.as_ref().map(|e| e.stats()).unwrap_or_default(),
            compute: self.compute.stats(),
        }
    }

    /// Sample the host, recompute load, publish a snapshot.
    pub fn collect_metrics(&self) -> MetricsSnapshot {
        let (cpu, memory) = self.probe.sample();
        let latency = self.admission.take_window_latency();
        let p95_ms = latency.p95_ms();
        {
            let mut peak = self.peak_p95_ms.lock();
            *peak = peak.max(p95_ms);
        }
        let sample = LoadSample {
            cpu,
            memory,
            connections: self.registry.active() as f64 / self.registry.max_sessions().max(1) as f64,
            latency: LoadSample::latency_load(p95_ms, self.config.target_latency_ms),
        };
        self.admission.load_monitor().update(sample);

        let snapshot = self.build_snapshot(cpu, memory, latency);
        ::metrics::gauge!("fabric_load", snapshot.load);
        ::metrics::gauge!("fabric_sessions_active", snapshot.sessions.active as f64);
        ::metrics::gauge!("fabric_queue_depth", snapshot.admission.queue_depth as f64);
        debug!(
            load = snapshot.load,
            level = snapshot.level.as_str(),
            sessions = snapshot.sessions.active,
            p95_us = snapshot.latency.p95_us,
            "Metrics snapshot"
        );
        *self.latest.write() = Some(snapshot.clone());
        let _ = self.snapshots.send(snapshot.clone());
        snapshot
    }

    pub fn scaling_recommendation(&self) -> ScalingRecommendation {
        let p95_ms = std::mem::take(&mut *self.peak_p95_ms.lock());
        recommend(
            self.admission.connection_utilization(),
            p95_ms,
            self.config.target_latency_ms,
        )
    }

    pub fn performance_report(&self) -> PerformanceReport {
        let snapshot = self
            .latest_snapshot()
            .unwrap_or_else(|| self.build_snapshot(0.0, 0.0, LatencySummary::default()));
        PerformanceReport::from_snapshot(&snapshot, self.admission.latency())
    }

    // ---- lifecycle ----

    /// Spawn every ticker task. They all stop when `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![
            tokio::spawn(
                self.clone()
                    .run_session_events(self.registry.subscribe(), cancel.clone()),
            ),
            tokio::spawn(session::run_heartbeat(
                self.registry.clone(),
                self.config.heartbeat_period(),
                cancel.clone(),
            )),
            tokio::spawn(scheduler::run_drain_loop(
                self.admission.clone(),
                self.clone() as Arc<dyn Dispatcher>,
                cancel.clone(),
            )),
            tokio::spawn(self.clone().run_metrics(cancel.clone())),
            tokio::spawn(self.clone().run_reports(cancel.clone())),
            tokio::spawn(self.clone().run_scaling_advice(cancel.clone())),
        ];
        if self.config.adaptive_scaling_enabled {
            tasks.push(tokio::spawn(scheduler::run_adaptive_scaling(
                self.admission.clone(),
                ADAPTIVE_SCALING_PERIOD,
                cancel.clone(),
            )));
        }
        info!(tasks = tasks.len(), "Orchestrator tasks started");
        tasks
    }

    /// Keep the admission connection count in step with the registry. Events
    /// only trigger a resync, so skipped ones cannot leave it drifting.
    async fn run_session_events(
        self: Arc<Self>,
        mut events: broadcast::Receiver<SessionEvent>,
        cancel: CancellationToken,
    ) {
        self.admission.sync_connections(self.registry.active());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(SessionEvent::Opened { id, remote, shard }) => {
                        self.admission.sync_connections(self.registry.active());
                        debug!(session = %id, %remote, shard, "Session opened");
                    }
                    Ok(SessionEvent::Closed { id, reason }) => {
                        self.admission.sync_connections(self.registry.active());
                        debug!(session = %id, reason = %reason, "Session closed");
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Session event stream lagged, resyncing");
                        self.admission.sync_connections(self.registry.active());
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn run_metrics(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(METRICS_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.collect_metrics();
                }
            }
        }
    }

    async fn run_reports(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(REPORT_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    info!("Performance report: {}", self.performance_report().summary());
                }
            }
        }
    }

    async fn run_scaling_advice(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(SCALING_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let rec = self.scaling_recommendation();
                    match rec.action {
                        ScalingAction::Hold => debug!(utilization = rec.utilization, p95_ms = rec.p95_ms, "Scaling: hold"),
                        action => info!(?action, utilization = rec.utilization, p95_ms = rec.p95_ms, target_ms = rec.target_ms, "Scaling recommendation"),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Dispatcher for Orchestrator {
    async fn dispatch(&self, _class: PriorityClass, item: QueuedRequest) {
        let QueuedRequest {
            request, origin, ..
        } = item;
        let request_id = request.id.clone();
        let outcome = match self.dispatch_request(&request, &origin).await {
            Ok(data) => Outcome::Response(data),
            Err(err) => Outcome::Rejected(err),
        };
        if let Some(session) = origin.session {
            // The session may have gone away while the request was queued.
            let _ = self.registry.send(&session, outcome.into_frame(request_id));
        }
    }
}

/// A state write carried in an `agent_update` payload: either
/// `{"agentId": .., "state": ..}` or `{"key": .., "value": ..}`.
struct StateWrite {
    key: String,
    value: Bytes,
}

impl StateWrite {
    fn from_payload(payload: &Value) -> FabricResult<Option<Self>> {
        let encode = |v: &Value| {
            serde_json::to_vec(v)
                .map(Bytes::from)
                .map_err(|e| FabricError::BadRequest(format!("state: {}", e)))
        };
        if let (Some(id), Some(state)) = (payload.get("agentId").and_then(Value::as_str), payload.get("state")) {
            return Ok(Some(Self {
                key: agent_key(id),
                value: encode(state)?,
            }));
        }
        if let (Some(key), Some(value)) = (payload.get("key").and_then(Value::as_str), payload.get("value")) {
            if key.is_empty() {
                return Err(FabricError::BadRequest("empty key".into()));
            }
            return Ok(Some(Self {
                key: key.to_string(),
                value: encode(value)?,
            }));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionClass;
    use crate::session::AcceptParams;
    use std::net::{Ipv4Addr, SocketAddr};

    fn orchestrator() -> Orchestrator {
        let mut config = FabricConfig::default();
        config.shard_count = 4;
        config.ddos_enabled = false;
        Orchestrator::new(config).with_probe(Arc::new(StaticProbe::default()))
    }

    fn origin() -> RequestOrigin {
        RequestOrigin::anonymous(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
    }

    #[tokio::test]
    async fn test_connection_count_recovers_after_event_lag() {
        let o = Arc::new(orchestrator());
        let cancel = CancellationToken::new();
        o.start(&cancel);

        // Overflow the event channel before the pump gets to run.
        let mut handles = Vec::new();
        for i in 0..5_000u32 {
            let remote = SocketAddr::from(([10, 1, (i >> 8) as u8, i as u8], 40_000));
            handles.push(o.registry().accept(AcceptParams::new(remote, 0)).unwrap());
        }
        for handle in handles.drain(..1_000) {
            assert!(o.registry().close(&handle.id, "test"));
        }

        for _ in 0..100 {
            if o.admission().active_connections() == 4_000 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(o.registry().active(), 4_000);
        assert_eq!(o.admission().active_connections(), 4_000);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_agent_roundtrip() {
        let o = orchestrator();
        let state = json!({"cash": "100.25", "mood": "calm"});
        assert_eq!(o.store_agent("a1", &state).await.unwrap(), 1);
        assert_eq!(o.load_agent("a1").await.unwrap(), Some(state));
        assert_eq!(o.load_agent("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_agent_update_request_writes_store() {
        let o = orchestrator();
        let request = Request::new(
            RequestType::AgentUpdate,
            json!({"agentId": "a2", "state": {"x": 1}}),
        );
        match o.submit_request(request, origin()).await {
            Outcome::Response(data) => assert_eq!(data["version"], 1),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(o.load_agent("a2").await.unwrap(), Some(json!({"x": 1})));
    }

    #[tokio::test]
    async fn test_public_writes_reach_edges_at_store_version() {
        let o = orchestrator();
        o.write_state("market:wheat", Bytes::from_static(b"1")).await.unwrap();
        let version = o
            .write_state("market:wheat", Bytes::from_static(b"2"))
            .await
            .unwrap();
        assert_eq!(version, 2);
        let fetched = o.fetch("market:wheat", "eu-west").await.unwrap().unwrap();
        assert_eq!(fetched.version, version);
        assert_eq!(fetched.payload, Bytes::from_static(b"2"));

        o.write_state("private:x", Bytes::from_static(b"p")).await.unwrap();
        assert_eq!(o.fetch("private:x", "eu-west").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_committed_write_succeeds_when_edges_hold_newer() {
        let o = orchestrator();
        // Edges already carry a later version than the store will assign.
        o.distribute(
            "market:corn",
            Bytes::from_static(b"edge"),
            &DistributeOptions::push_all().with_version(5),
        )
        .unwrap();

        let version = o
            .write_state("market:corn", Bytes::from_static(b"store"))
            .await
            .unwrap();
        assert_eq!(version, 1);
        assert_eq!(
            o.store().get("market:corn").await.unwrap(),
            Some(Bytes::from_static(b"store"))
        );
        let fetched = o.fetch("market:corn", "us-east").await.unwrap().unwrap();
        assert_eq!(fetched.version, 5);
        assert_eq!(fetched.payload, Bytes::from_static(b"edge"));
    }

    #[tokio::test]
    async fn test_emergency_override_gates_non_critical() {
        let o = orchestrator();
        o.force_degradation(Some(DegradationLevel::Emergency));
        let rejected = o
            .submit_request(Request::new(RequestType::Analytics, json!({})), origin())
            .await;
        match rejected {
            Outcome::Rejected(err) => assert_eq!(err.code(), 503),
            other => panic!("unexpected outcome {:?}", other),
        }
        let admitted = o
            .submit_request(
                Request::new(RequestType::TradeExecution, json!({})),
                origin().with_class(SessionClass::Standard),
            )
            .await;
        assert!(matches!(admitted, Outcome::Response(_)));
    }

    #[tokio::test]
    async fn test_forced_breaker_rejects_endpoint() {
        let o = orchestrator();
        o.force_breaker_open("user_command");
        match o
            .submit_request(Request::new(RequestType::UserCommand, json!({})), origin())
            .await
        {
            Outcome::Rejected(err) => assert_eq!(err.reason(), "circuit_open"),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(matches!(
            o.submit_request(Request::new(RequestType::MarketData, json!({})), origin())
                .await,
            Outcome::Response(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_request_is_answered_on_its_session() {
        let o = Arc::new(orchestrator());
        let cancel = CancellationToken::new();
        o.start(&cancel);
        let mut handle = o
            .registry()
            .accept(crate::session::AcceptParams::new(
                std::net::SocketAddr::from(([10, 0, 0, 2], 4000)),
                0,
            ))
            .unwrap();
        o.admission().load_monitor().set_load(0.75);

        let mut from = origin();
        from.session = Some(handle.id);
        let request = Request::new(RequestType::Analytics, json!({})).with_id("q1");
        assert!(matches!(
            o.submit_request(request, from).await,
            Outcome::Queued { .. }
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        match handle.egress.try_recv() {
            Ok(crate::session::Outbound::Frame(ServerFrame::Response { request_id, success, .. })) => {
                assert_eq!(request_id.as_deref(), Some("q1"));
                assert!(success);
            }
            other => panic!("expected response frame, got {:?}", other),
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_collect_metrics_updates_load_and_publishes() {
        let o = orchestrator().with_probe(Arc::new(StaticProbe {
            cpu: 1.0,
            memory: 1.0,
        }));
        let mut rx = o.subscribe_metrics();
        let snapshot = o.collect_metrics();
        assert!((snapshot.load - 0.5).abs() < 1e-9);
        assert_eq!(rx.recv().await.unwrap().timestamp, snapshot.timestamp);
        assert!(o.latest_snapshot().is_some());
    }

    #[test]
    fn test_outcome_frames() {
        let frame = Outcome::Rejected(FabricError::too_many("rate_limited", Duration::from_millis(800)))
            .into_frame(Some("r1".into()));
        let encoded: Value = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(encoded["type"], "rejected");
        assert_eq!(encoded["code"], 429);
        assert_eq!(encoded["retry_after_ms"], 800);
        assert_eq!(encoded["requestId"], "r1");
    }
}
