//! Admission pipeline
//!
//! Every inbound request walks the stages in order and the first rejecting
//! stage short-circuits:
//!
//! 1. syntactic validation
//! 2. emergency gate
//! 3. DDoS heuristics
//! 4. rate limits (connection bucket, global window, per-address levels,
//!    user-agent buckets)
//! 5. circuit breaker
//! 6. admission control (load ceiling, priority threshold)
//! 7. priority queueing for requests under the threshold
//!
//! The pipeline never panics or propagates errors to its caller; every
//! outcome is an [`Admission`].

use parking_lot::Mutex;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::breaker::{BreakerDecision, BreakerRegistry};
use super::ddos::DdosScreen;
use super::degradation::{DegradationLevel, LoadMonitor};
use super::priority::{self, PriorityClass};
use super::queue::{EnqueueOutcome, PriorityQueues, QueuedRequest};
use super::rate_limit::{
    HierarchicalLimiter, LimitScale, PatternLimiter, RateLimitResult, SlidingWindow, TokenBucket,
};
use crate::config::FabricConfig;
use crate::error::{FabricError, FabricResult};
use crate::latency::{LatencyHistogram, LatencySummary};
use crate::models::{Request, RequestOrigin, RequestType};

/// Loads above this are rejected outright.
pub const LOAD_CEILING: f64 = 0.95;

const MIN_LIMIT_SCALE: f64 = 0.25;
const MAX_LIMIT_SCALE: f64 = 2.0;

/// A request cleared for immediate dispatch.
#[derive(Debug, Clone)]
pub struct AdmittedRequest {
    pub request: Request,
    pub origin: RequestOrigin,
    pub score: i32,
    pub class: PriorityClass,
    /// Dispatched as a half-open breaker probe.
    pub probe: bool,
}

#[derive(Debug)]
pub enum Admission {
    Admitted(AdmittedRequest),
    Queued {
        class: PriorityClass,
        estimated_wait: Duration,
    },
    Rejected(FabricError),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }

    pub fn rejection(&self) -> Option<&FabricError> {
        match self {
            Admission::Rejected(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct AdmissionCounters {
    admitted: AtomicU64,
    queued: AtomicU64,
    rejected: AtomicU64,
    bad_request: AtomicU64,
    too_many: AtomicU64,
    unavailable: AtomicU64,
    dispatch_failures: AtomicU64,
    internal_errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionStats {
    pub admitted: u64,
    pub queued: u64,
    pub rejected: u64,
    pub rejected_bad_request: u64,
    pub rejected_too_many: u64,
    pub rejected_unavailable: u64,
    pub dispatch_failures: u64,
    pub internal_errors: u64,
    pub active_connections: usize,
    pub limit_scale: f64,
    pub load: f64,
    pub level: DegradationLevel,
    pub open_breakers: usize,
    pub queue_depth: usize,
    pub queue_dropped: u64,
}

pub struct AdmissionPipeline {
    max_payload_bytes: usize,
    enabled: bool,
    ddos_enabled: bool,
    max_connections: usize,
    load: Arc<LoadMonitor>,
    breakers: BreakerRegistry,
    ddos: DdosScreen,
    connection_bucket: Mutex<TokenBucket>,
    request_window: Mutex<SlidingWindow>,
    per_address: HierarchicalLimiter<IpAddr>,
    user_agents: PatternLimiter,
    scale: LimitScale,
    queues: Arc<PriorityQueues>,
    active_connections: AtomicUsize,
    counters: AdmissionCounters,
    window_latency: LatencyHistogram,
    total_latency: LatencyHistogram,
}

impl AdmissionPipeline {
    pub fn new(config: &FabricConfig, load: Arc<LoadMonitor>) -> Self {
        let limits = &config.limits;
        Self {
            max_payload_bytes: config.max_payload_bytes,
            enabled: config.enable_admission,
            ddos_enabled: config.ddos_enabled,
            max_connections: config.max_connections,
            load,
            breakers: BreakerRegistry::new(config.breaker.clone()),
            ddos: DdosScreen::new(config.ddos.clone()),
            connection_bucket: Mutex::new(TokenBucket::new(
                limits.global_connection_burst,
                limits.global_connection_rate,
            )),
            request_window: Mutex::new(SlidingWindow::new(
                Duration::from_millis(limits.global_request_window_ms),
                limits.global_request_limit,
            )),
            per_address: HierarchicalLimiter::new(limits.address_levels.clone()),
            user_agents: PatternLimiter::new(&limits.user_agent_limits),
            scale: LimitScale::new(),
            queues: Arc::new(PriorityQueues::new(limits.queue_capacity)),
            active_connections: AtomicUsize::new(0),
            counters: AdmissionCounters::default(),
            window_latency: LatencyHistogram::new(),
            total_latency: LatencyHistogram::new(),
        }
    }

    pub fn admit(&self, request: Request, origin: RequestOrigin) -> Admission {
        self.admit_at(request, origin, Instant::now())
    }

    /// Run a request through every stage.
    pub fn admit_at(&self, request: Request, origin: RequestOrigin, now: Instant) -> Admission {
        let outcome = self.evaluate(request, origin, now, true);
        self.count(&outcome);
        outcome
    }

    /// Admission for a new transport. Connections are never queued: one that
    /// would fall under the priority threshold is rejected instead.
    pub fn admit_connection_at(&self, origin: &RequestOrigin, now: Instant) -> FabricResult<()> {
        let request = Request::new(RequestType::SessionConnect, serde_json::Value::Null);
        let outcome = self.evaluate(request, origin.clone(), now, false);
        self.count(&outcome);
        match outcome {
            Admission::Rejected(e) => Err(e),
            _ => Ok(()),
        }
    }

    fn count(&self, outcome: &Admission) {
        match outcome {
            Admission::Admitted(a) => {
                self.counters.admitted.fetch_add(1, Ordering::Relaxed);
                metrics::increment_counter!("fabric_admission_admitted_total", "type" => a.request.kind.as_str());
            }
            Admission::Queued { class, .. } => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                metrics::increment_counter!("fabric_admission_queued_total", "class" => class.as_str());
            }
            Admission::Rejected(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                let bucket = match e.code() {
                    400 | 413 => &self.counters.bad_request,
                    429 => &self.counters.too_many,
                    _ => &self.counters.unavailable,
                };
                bucket.fetch_add(1, Ordering::Relaxed);
                metrics::increment_counter!("fabric_admission_rejected_total", "reason" => e.reason());
            }
        }
    }

    fn evaluate(
        &self,
        request: Request,
        origin: RequestOrigin,
        now: Instant,
        allow_queue: bool,
    ) -> Admission {
        if let Err(e) = self.validate(&request) {
            return Admission::Rejected(e);
        }

        let score = priority::score(&request, &origin);
        let class = PriorityClass::from_score(score);
        if !self.enabled {
            return Admission::Admitted(AdmittedRequest {
                request,
                origin,
                score,
                class,
                probe: false,
            });
        }

        let level = self.load.level();
        if level == DegradationLevel::Emergency && !request.kind.is_critical() {
            return Admission::Rejected(FabricError::unavailable("emergency_mode"));
        }

        if self.ddos_enabled {
            if let Err(e) = self.ddos.screen_at(&origin, request.kind, now) {
                return Admission::Rejected(e);
            }
        }

        if let Err(e) = self.check_rate_limits(&request, &origin, now) {
            debug!(remote = %origin.remote, reason = e.reason(), "Rate limited");
            return Admission::Rejected(e);
        }

        let endpoint = request.kind.as_str();
        let probe = match self.breakers.check_at(endpoint, now) {
            BreakerDecision::Allow => false,
            BreakerDecision::Probe => true,
            BreakerDecision::Reject { retry_after } => {
                return Admission::Rejected(FabricError::Unavailable {
                    reason: "circuit_open",
                    retry_after: Some(retry_after),
                });
            }
        };

        let load = self.load.load();
        if load > LOAD_CEILING {
            if probe {
                self.breakers.release_probe(endpoint);
            }
            return Admission::Rejected(FabricError::unavailable("overloaded"));
        }

        if score < level.priority_threshold() && !probe {
            if !allow_queue {
                return Admission::Rejected(FabricError::unavailable("degraded"));
            }
            let outcome = self.queues.enqueue_at(
                QueuedRequest {
                    request,
                    origin,
                    score,
                    enqueued_at: now,
                },
                now,
            );
            return match outcome.class() {
                Some(queued_in) => {
                    if let EnqueueOutcome::Spilled { from, to } = outcome {
                        debug!(from = from.as_str(), to = to.as_str(), "Queue spill");
                    }
                    Admission::Queued {
                        class: queued_in,
                        estimated_wait: self.queues.estimated_wait(queued_in, load),
                    }
                }
                None => Admission::Rejected(FabricError::unavailable("queue_full")),
            };
        }

        if self.ddos_enabled {
            self.ddos.record_admitted(origin.remote);
        }
        Admission::Admitted(AdmittedRequest {
            request,
            origin,
            score,
            class,
            probe,
        })
    }

    fn validate(&self, request: &Request) -> FabricResult<()> {
        if request.size_bytes > self.max_payload_bytes {
            return Err(FabricError::PayloadTooLarge {
                size: request.size_bytes,
                limit: self.max_payload_bytes,
            });
        }
        if !(request.payload.is_object() || request.payload.is_null()) {
            return Err(FabricError::BadRequest("payload must be an object".into()));
        }
        Ok(())
    }

    fn check_rate_limits(
        &self,
        request: &Request,
        origin: &RequestOrigin,
        now: Instant,
    ) -> FabricResult<()> {
        let scale = self.scale.get();
        if request.kind == RequestType::SessionConnect {
            if let RateLimitResult::Exceeded { retry_after } =
                self.connection_bucket.lock().check_at(now, scale)
            {
                return Err(FabricError::too_many("connection_rate_limited", retry_after));
            }
        }
        if let RateLimitResult::Exceeded { retry_after } =
            self.request_window.lock().check_at(now, scale)
        {
            return Err(FabricError::too_many("rate_limited", retry_after));
        }
        if let RateLimitResult::Exceeded { retry_after } =
            self.per_address.check_at(&origin.remote, now)
        {
            return Err(FabricError::too_many("address_rate_limited", retry_after));
        }
        if let Some(ua) = origin.user_agent.as_deref() {
            if let RateLimitResult::Exceeded { retry_after } = self.user_agents.check_at(ua, now) {
                return Err(FabricError::too_many("user_agent_rate_limited", retry_after));
            }
        }
        Ok(())
    }

    /// Record the result of dispatching an admitted or dequeued request.
    pub fn record_outcome<T>(
        &self,
        kind: RequestType,
        result: &FabricResult<T>,
        latency: Duration,
    ) {
        self.record_outcome_at(kind, result, latency, Instant::now())
    }

    pub fn record_outcome_at<T>(
        &self,
        kind: RequestType,
        result: &FabricResult<T>,
        latency: Duration,
        now: Instant,
    ) {
        self.window_latency.record_duration(latency);
        self.total_latency.record_duration(latency);
        metrics::histogram!("fabric_request_latency_seconds", latency.as_secs_f64());
        match result {
            Ok(_) => self.breakers.record_success(kind.as_str()),
            Err(e) if e.counts_as_failure() => {
                self.counters
                    .dispatch_failures
                    .fetch_add(1, Ordering::Relaxed);
                if matches!(e, FabricError::Internal(_)) {
                    self.counters.internal_errors.fetch_add(1, Ordering::Relaxed);
                    metrics::increment_counter!("fabric_internal_errors_total");
                }
                self.breakers.record_failure_at(kind.as_str(), now);
            }
            // Client-side errors say nothing about endpoint health.
            Err(_) => self.breakers.record_success(kind.as_str()),
        }
    }

    /// Adjust limit scale and breaker sensitivity for load `load`.
    /// Returns the new limit scale.
    pub fn adapt_limits(&self, load: f64) -> f64 {
        let current = self.scale.get();
        let factor = if load > 0.8 {
            0.8 - ((load - 0.8) / 0.2).min(1.0) * 0.1
        } else if load < 0.4 {
            1.2 + ((0.4 - load) / 0.4).min(1.0) * 0.1
        } else {
            1.0
        };
        let next = (current * factor).clamp(MIN_LIMIT_SCALE, MAX_LIMIT_SCALE);
        if (next - current).abs() > f64::EPSILON {
            info!(load, factor, scale = next, "Adaptive scaling adjusted limits");
        }
        self.scale.set(next);
        self.per_address.set_scale(next);
        self.user_agents.set_scale(next);
        self.breakers.set_tighten(if load > 0.9 { 0.5 } else { 1.0 });
        metrics::gauge!("fabric_limit_scale", next);
        next
    }

    /// Mirror the session registry's live count.
    pub fn sync_connections(&self, active: usize) {
        self.active_connections.store(active, Ordering::Relaxed);
        metrics::gauge!("fabric_admission_connections", active as f64);
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn connection_utilization(&self) -> f64 {
        self.active_connections() as f64 / self.max_connections.max(1) as f64
    }

    /// Operator control: force a degradation level, or clear with `None`.
    /// Validation still applies to every request.
    pub fn set_degradation_override(&self, level: Option<DegradationLevel>) {
        self.load.set_override(level);
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn ddos(&self) -> &DdosScreen {
        &self.ddos
    }

    pub fn queues(&self) -> &Arc<PriorityQueues> {
        &self.queues
    }

    pub fn load_monitor(&self) -> &Arc<LoadMonitor> {
        &self.load
    }

    pub fn limit_scale(&self) -> f64 {
        self.scale.get()
    }

    /// Latency since the previous call.
    pub fn take_window_latency(&self) -> LatencySummary {
        self.window_latency.take()
    }

    pub fn latency(&self) -> LatencySummary {
        self.total_latency.summary()
    }

    pub fn cleanup(&self, now: Instant) {
        self.per_address.cleanup(now);
        self.ddos.cleanup(now);
    }

    pub fn stats(&self) -> AdmissionStats {
        let c = &self.counters;
        AdmissionStats {
            admitted: c.admitted.load(Ordering::Relaxed),
            queued: c.queued.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            rejected_bad_request: c.bad_request.load(Ordering::Relaxed),
            rejected_too_many: c.too_many.load(Ordering::Relaxed),
            rejected_unavailable: c.unavailable.load(Ordering::Relaxed),
            dispatch_failures: c.dispatch_failures.load(Ordering::Relaxed),
            internal_errors: c.internal_errors.load(Ordering::Relaxed),
            active_connections: self.active_connections(),
            limit_scale: self.scale.get(),
            load: self.load.load(),
            level: self.load.level(),
            open_breakers: self.breakers.open_count(),
            queue_depth: self.queues.total_depth(),
            queue_dropped: self.queues.dropped(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use std::net::Ipv4Addr;

    fn pipeline(configure: impl FnOnce(&mut FabricConfig)) -> AdmissionPipeline {
        let mut config = FabricConfig::default();
        config.ddos_enabled = false;
        configure(&mut config);
        AdmissionPipeline::new(&config, Arc::new(LoadMonitor::new()))
    }

    fn origin() -> RequestOrigin {
        RequestOrigin::anonymous(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)))
    }

    fn analytics() -> Request {
        Request::new(RequestType::Analytics, serde_json::json!({}))
    }

    #[test]
    fn test_oversize_is_413_and_bad_payload_is_400() {
        let p = pipeline(|_| {});
        let big = analytics().with_size(2 * 1024 * 1024);
        assert_eq!(p.admit(big, origin()).rejection().unwrap().code(), 413);

        let bad = Request::new(RequestType::Analytics, serde_json::json!([1, 2]));
        assert_eq!(p.admit(bad, origin()).rejection().unwrap().code(), 400);
    }

    #[test]
    fn test_emergency_gate_whitelist() {
        let p = pipeline(|_| {});
        p.set_degradation_override(Some(DegradationLevel::Emergency));
        let rejected = p.admit(analytics(), origin());
        assert_eq!(rejected.rejection().unwrap().code(), 503);
        assert_eq!(rejected.rejection().unwrap().reason(), "emergency_mode");

        let trade = Request::new(RequestType::TradeExecution, serde_json::json!({}));
        assert!(p.admit(trade, origin()).is_admitted());
    }

    #[test]
    fn test_global_window_rejects_with_retry_hint() {
        let p = pipeline(|c| {
            c.limits.global_request_limit = 3;
        });
        let t0 = Instant::now();
        for i in 0..3 {
            let at = t0 + Duration::from_millis(i * 100);
            assert!(p.admit_at(analytics(), origin(), at).is_admitted());
        }
        let out = p.admit_at(analytics(), origin(), t0 + Duration::from_millis(400));
        let err = out.rejection().unwrap();
        assert_eq!(err.code(), 429);
        assert_eq!(err.retry_after_ms(), 600);
    }

    #[test]
    fn test_connection_bucket_only_for_connects() {
        let p = pipeline(|c| {
            c.limits.global_connection_burst = 1.0;
            c.limits.global_connection_rate = 1.0;
        });
        let now = Instant::now();
        assert!(p.admit_connection_at(&origin(), now).is_ok());
        let err = p.admit_connection_at(&origin(), now).unwrap_err();
        assert_eq!(err.reason(), "connection_rate_limited");
        assert!(p.admit_at(analytics(), origin(), now).is_admitted());
    }

    #[test]
    fn test_breaker_rejects_without_dispatch_then_probes() {
        let p = pipeline(|c| {
            c.breaker = BreakerConfig {
                failure_threshold: 5,
                open_ms: 30_000,
                success_threshold: 3,
            };
        });
        let t0 = Instant::now();
        for _ in 0..5 {
            let r: FabricResult<()> = Err(FabricError::Timeout("handler"));
            p.record_outcome_at(RequestType::TradeExecution, &r, Duration::from_millis(1), t0);
        }
        let trade = || Request::new(RequestType::TradeExecution, serde_json::json!({}));
        let out = p.admit_at(trade(), origin(), t0 + Duration::from_secs(1));
        assert_eq!(out.rejection().unwrap().reason(), "circuit_open");
        assert_eq!(out.rejection().unwrap().code(), 503);

        match p.admit_at(trade(), origin(), t0 + Duration::from_secs(30)) {
            Admission::Admitted(a) => assert!(a.probe),
            other => panic!("expected probe, got {:?}", other),
        }
    }

    #[test]
    fn test_below_threshold_is_queued() {
        let load = Arc::new(LoadMonitor::new());
        let mut config = FabricConfig::default();
        config.ddos_enabled = false;
        let p = AdmissionPipeline::new(&config, load.clone());
        load.set_load(0.75);

        match p.admit(analytics(), origin()) {
            Admission::Queued { class, estimated_wait } => {
                assert_eq!(class, PriorityClass::Low);
                assert!(estimated_wait >= super::super::queue::DRAIN_TICK);
            }
            other => panic!("expected queued, got {:?}", other),
        }
        let trade = Request::new(RequestType::TradeExecution, serde_json::json!({}));
        assert!(p.admit(trade, origin()).is_admitted());
        assert_eq!(p.queues().total_depth(), 1);
    }

    #[test]
    fn test_load_ceiling() {
        let load = Arc::new(LoadMonitor::new());
        let p = AdmissionPipeline::new(&FabricConfig::default(), load.clone());
        load.set_load(0.97);
        let trade = Request::new(RequestType::TradeExecution, serde_json::json!({}));
        assert_eq!(
            p.admit(trade, origin()).rejection().unwrap().reason(),
            "overloaded"
        );
    }

    #[test]
    fn test_adaptive_scaling_bounds() {
        let p = pipeline(|_| {});
        let shrunk = p.adapt_limits(1.0);
        assert!((shrunk - 0.7).abs() < 1e-9);
        for _ in 0..20 {
            p.adapt_limits(1.0);
        }
        assert_eq!(p.limit_scale(), 0.25);
        let grown = p.adapt_limits(0.0);
        assert!((grown - 0.25 * 1.3).abs() < 1e-9);
        assert_eq!(p.adapt_limits(0.6), grown);
    }

    #[test]
    fn test_disabled_admission_only_validates() {
        let p = pipeline(|c| {
            c.enable_admission = false;
            c.limits.global_request_limit = 1;
        });
        p.set_degradation_override(Some(DegradationLevel::Emergency));
        for _ in 0..5 {
            assert!(p.admit(analytics(), origin()).is_admitted());
        }
        let big = analytics().with_size(usize::MAX);
        assert_eq!(p.admit(big, origin()).rejection().unwrap().code(), 413);
    }
}
