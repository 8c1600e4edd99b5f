//! Per-endpoint circuit breakers.
//!
//! CLOSED counts consecutive failures; at the threshold the breaker opens.
//! OPEN rejects until the open duration has elapsed since the last failure,
//! then admits a single half-open probe at a time. HALF_OPEN closes after
//! `success_threshold` consecutive successes; any failure reopens it.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// What a breaker decided about one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    Allow,
    /// Allowed as the half-open probe; the outcome must be reported.
    Probe,
    Reject { retry_after: Duration },
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    pub last_failure: Option<Instant>,
    pub failure_threshold: u32,
    pub open_duration: Duration,
    pub success_threshold: u32,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_duration: Duration, success_threshold: u32) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            last_failure: None,
            failure_threshold: failure_threshold.max(1),
            open_duration,
            success_threshold: success_threshold.max(1),
            probe_in_flight: false,
        }
    }

    fn effective_threshold(&self, tighten: f64) -> u32 {
        ((self.failure_threshold as f64 * tighten).ceil() as u32).max(1)
    }

    pub fn check_at(&mut self, now: Instant) -> BreakerDecision {
        match self.state {
            CircuitState::Closed => BreakerDecision::Allow,
            CircuitState::Open => {
                let since = self
                    .last_failure
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or(self.open_duration);
                if since >= self.open_duration {
                    self.state = CircuitState::HalfOpen;
                    self.successes = 0;
                    self.probe_in_flight = true;
                    BreakerDecision::Probe
                } else {
                    BreakerDecision::Reject {
                        retry_after: self.open_duration - since,
                    }
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    BreakerDecision::Reject {
                        retry_after: Duration::from_millis(100),
                    }
                } else {
                    self.probe_in_flight = true;
                    BreakerDecision::Probe
                }
            }
        }
    }

    /// Returns the new state when a transition happened.
    pub fn record_success(&mut self) -> Option<CircuitState> {
        match self.state {
            CircuitState::Closed => {
                self.failures = 0;
                None
            }
            CircuitState::HalfOpen => {
                self.probe_in_flight = false;
                self.successes += 1;
                if self.successes >= self.success_threshold {
                    self.state = CircuitState::Closed;
                    self.failures = 0;
                    self.successes = 0;
                    Some(CircuitState::Closed)
                } else {
                    None
                }
            }
            // A late success from before the trip does not close the breaker.
            CircuitState::Open => None,
        }
    }

    pub fn record_failure_at(&mut self, now: Instant, tighten: f64) -> Option<CircuitState> {
        self.last_failure = Some(now);
        match self.state {
            CircuitState::Closed => {
                self.failures += 1;
                if self.failures >= self.effective_threshold(tighten) {
                    self.state = CircuitState::Open;
                    Some(CircuitState::Open)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                self.probe_in_flight = false;
                self.successes = 0;
                self.state = CircuitState::Open;
                Some(CircuitState::Open)
            }
            CircuitState::Open => None,
        }
    }
}

/// Breakers keyed by endpoint name.
pub struct BreakerRegistry {
    config: BreakerConfig,
    overrides: RwLock<HashMap<String, BreakerConfig>>,
    breakers: RwLock<HashMap<String, CircuitBreaker>>,
    /// Threshold multiplier; 0.5 under heavy load.
    tighten: RwLock<f64>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            overrides: RwLock::new(HashMap::new()),
            breakers: RwLock::new(HashMap::new()),
            tighten: RwLock::new(1.0),
        }
    }

    /// Use a dedicated configuration for one endpoint.
    pub fn configure(&self, endpoint: &str, config: BreakerConfig) {
        self.breakers.write().remove(endpoint);
        self.overrides.write().insert(endpoint.to_string(), config);
    }

    fn new_breaker(&self, endpoint: &str) -> CircuitBreaker {
        let overrides = self.overrides.read();
        let config = overrides.get(endpoint).unwrap_or(&self.config);
        CircuitBreaker::new(
            config.failure_threshold,
            Duration::from_millis(config.open_ms),
            config.success_threshold,
        )
    }

    pub fn check_at(&self, endpoint: &str, now: Instant) -> BreakerDecision {
        {
            let breakers = self.breakers.read();
            match breakers.get(endpoint) {
                None => return BreakerDecision::Allow,
                Some(cb) if cb.state == CircuitState::Closed => return BreakerDecision::Allow,
                Some(_) => {}
            }
        }
        let mut breakers = self.breakers.write();
        match breakers.get_mut(endpoint) {
            Some(cb) => {
                let decision = cb.check_at(now);
                if decision == BreakerDecision::Probe {
                    info!(endpoint, "Circuit half-open, admitting probe");
                }
                decision
            }
            None => BreakerDecision::Allow,
        }
    }

    pub fn record_success(&self, endpoint: &str) {
        {
            let breakers = self.breakers.read();
            match breakers.get(endpoint) {
                None => return,
                Some(cb) if cb.state == CircuitState::Closed && cb.failures == 0 => return,
                Some(_) => {}
            }
        }
        let mut breakers = self.breakers.write();
        if let Some(cb) = breakers.get_mut(endpoint) {
            if cb.record_success() == Some(CircuitState::Closed) {
                info!(endpoint, "Circuit closed");
                metrics::increment_counter!("fabric_breaker_transitions_total", "to" => "closed");
            }
        }
    }

    pub fn record_failure_at(&self, endpoint: &str, now: Instant) {
        let tighten = *self.tighten.read();
        let mut breakers = self.breakers.write();
        if !breakers.contains_key(endpoint) {
            let breaker = self.new_breaker(endpoint);
            breakers.insert(endpoint.to_string(), breaker);
        }
        if let Some(cb) = breakers.get_mut(endpoint) {
            if cb.record_failure_at(now, tighten) == Some(CircuitState::Open) {
                warn!(endpoint, failures = cb.failures, "Circuit opened");
                metrics::increment_counter!("fabric_breaker_transitions_total", "to" => "open");
            }
        }
    }

    /// Give back a probe slot that was granted but never dispatched.
    pub fn release_probe(&self, endpoint: &str) {
        if let Some(cb) = self.breakers.write().get_mut(endpoint) {
            cb.probe_in_flight = false;
        }
    }

    /// Operator control: trip a breaker immediately.
    pub fn force_open(&self, endpoint: &str) {
        self.force_open_at(endpoint, Instant::now())
    }

    pub fn force_open_at(&self, endpoint: &str, now: Instant) {
        let mut breakers = self.breakers.write();
        let breaker = breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| self.new_breaker(endpoint));
        breaker.state = CircuitState::Open;
        breaker.last_failure = Some(now);
        warn!(endpoint, "Circuit forced open");
    }

    pub fn state(&self, endpoint: &str) -> CircuitState {
        self.breakers
            .read()
            .get(endpoint)
            .map(|cb| cb.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn set_tighten(&self, factor: f64) {
        *self.tighten.write() = factor.clamp(0.1, 1.0);
    }

    pub fn open_count(&self) -> usize {
        self.breakers
            .read()
            .values()
            .filter(|cb| cb.state != CircuitState::Closed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(threshold: u32, open_ms: u64) -> BreakerRegistry {
        BreakerRegistry::new(BreakerConfig {
            failure_threshold: threshold,
            open_ms,
            success_threshold: 3,
        })
    }

    #[test]
    fn test_opens_at_threshold() {
        let reg = registry(3, 1_000);
        let now = Instant::now();
        for _ in 0..2 {
            reg.record_failure_at("trade_execution", now);
        }
        assert_eq!(reg.state("trade_execution"), CircuitState::Closed);
        reg.record_failure_at("trade_execution", now);
        assert_eq!(reg.state("trade_execution"), CircuitState::Open);
        assert!(matches!(
            reg.check_at("trade_execution", now),
            BreakerDecision::Reject { .. }
        ));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let reg = registry(3, 1_000);
        let now = Instant::now();
        reg.record_failure_at("x", now);
        reg.record_failure_at("x", now);
        reg.record_success("x");
        reg.record_failure_at("x", now);
        reg.record_failure_at("x", now);
        assert_eq!(reg.state("x"), CircuitState::Closed);
    }

    #[test]
    fn test_open_rejects_until_duration_elapsed() {
        let reg = registry(1, 30_000);
        let t0 = Instant::now();
        reg.record_failure_at("x", t0);
        for secs in [1u64, 10, 29] {
            match reg.check_at("x", t0 + Duration::from_secs(secs)) {
                BreakerDecision::Reject { retry_after } => {
                    assert_eq!(retry_after, Duration::from_secs(30 - secs));
                }
                other => panic!("expected reject at {}s, got {:?}", secs, other),
            }
        }
        assert_eq!(
            reg.check_at("x", t0 + Duration::from_secs(30)),
            BreakerDecision::Probe
        );
        assert_eq!(reg.state("x"), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_single_probe_and_close_after_three() {
        let reg = registry(1, 100);
        let t0 = Instant::now();
        reg.record_failure_at("x", t0);
        let t1 = t0 + Duration::from_millis(100);

        for _ in 0..2 {
            assert_eq!(reg.check_at("x", t1), BreakerDecision::Probe);
            assert!(matches!(reg.check_at("x", t1), BreakerDecision::Reject { .. }));
            reg.record_success("x");
            assert_eq!(reg.state("x"), CircuitState::HalfOpen);
        }
        assert_eq!(reg.check_at("x", t1), BreakerDecision::Probe);
        reg.record_success("x");
        assert_eq!(reg.state("x"), CircuitState::Closed);
        assert_eq!(reg.check_at("x", t1), BreakerDecision::Allow);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let reg = registry(1, 100);
        let t0 = Instant::now();
        reg.record_failure_at("x", t0);
        let t1 = t0 + Duration::from_millis(150);
        assert_eq!(reg.check_at("x", t1), BreakerDecision::Probe);
        reg.record_failure_at("x", t1);
        assert_eq!(reg.state("x"), CircuitState::Open);
        assert!(matches!(
            reg.check_at("x", t1 + Duration::from_millis(50)),
            BreakerDecision::Reject { .. }
        ));
    }

    #[test]
    fn test_tighten_halves_threshold() {
        let reg = registry(4, 1_000);
        reg.set_tighten(0.5);
        let now = Instant::now();
        reg.record_failure_at("x", now);
        reg.record_failure_at("x", now);
        assert_eq!(reg.state("x"), CircuitState::Open);
    }

    #[test]
    fn test_per_endpoint_configuration() {
        let reg = registry(5, 1_000);
        reg.configure(
            "fragile",
            BreakerConfig {
                failure_threshold: 1,
                open_ms: 1_000,
                success_threshold: 3,
            },
        );
        let now = Instant::now();
        reg.record_failure_at("fragile", now);
        reg.record_failure_at("sturdy", now);
        assert_eq!(reg.state("fragile"), CircuitState::Open);
        assert_eq!(reg.state("sturdy"), CircuitState::Closed);
    }
}
