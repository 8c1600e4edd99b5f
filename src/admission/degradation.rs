//! Load tracking and graceful degradation levels.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DegradationLevel {
    Normal = 0,
    Light = 1,
    Moderate = 2,
    Heavy = 3,
    Critical = 4,
    Emergency = 5,
}

impl DegradationLevel {
    pub const ALL: [DegradationLevel; 6] = [
        DegradationLevel::Normal,
        DegradationLevel::Light,
        DegradationLevel::Moderate,
        DegradationLevel::Heavy,
        DegradationLevel::Critical,
        DegradationLevel::Emergency,
    ];

    pub fn from_load(load: f64) -> Self {
        match load {
            l if l < 0.5 => DegradationLevel::Normal,
            l if l < 0.6 => DegradationLevel::Light,
            l if l < 0.7 => DegradationLevel::Moderate,
            l if l < 0.8 => DegradationLevel::Heavy,
            l if l < 0.9 => DegradationLevel::Critical,
            _ => DegradationLevel::Emergency,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        Self::ALL[(v as usize).min(5)]
    }

    /// Minimum priority admitted directly at this level.
    pub fn priority_threshold(&self) -> i32 {
        match self {
            DegradationLevel::Normal => 0,
            DegradationLevel::Light => 30,
            DegradationLevel::Moderate => 50,
            DegradationLevel::Heavy => 70,
            DegradationLevel::Critical => 85,
            DegradationLevel::Emergency => 95,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationLevel::Normal => "NORMAL",
            DegradationLevel::Light => "LIGHT",
            DegradationLevel::Moderate => "MODERATE",
            DegradationLevel::Heavy => "HEAVY",
            DegradationLevel::Critical => "CRITICAL",
            DegradationLevel::Emergency => "EMERGENCY",
        }
    }
}

/// One sample of the inputs to the load formula, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LoadSample {
    pub cpu: f64,
    pub memory: f64,
    pub connections: f64,
    pub latency: f64,
}

impl LoadSample {
    pub const CPU_WEIGHT: f64 = 0.3;
    pub const MEMORY_WEIGHT: f64 = 0.2;
    pub const CONNECTION_WEIGHT: f64 = 0.3;
    pub const LATENCY_WEIGHT: f64 = 0.2;

    /// Latency input: p95 relative to twice the target, so meeting the target
    /// contributes half weight.
    pub fn latency_load(p95_ms: f64, target_ms: u64) -> f64 {
        if target_ms == 0 {
            return 0.0;
        }
        (p95_ms / (2.0 * target_ms as f64)).clamp(0.0, 1.0)
    }

    pub fn load(&self) -> f64 {
        (self.cpu.clamp(0.0, 1.0) * Self::CPU_WEIGHT
            + self.memory.clamp(0.0, 1.0) * Self::MEMORY_WEIGHT
            + self.connections.clamp(0.0, 1.0) * Self::CONNECTION_WEIGHT
            + self.latency.clamp(0.0, 1.0) * Self::LATENCY_WEIGHT)
            .clamp(0.0, 1.0)
    }
}

const NO_OVERRIDE: u8 = u8::MAX;

/// Current load and degradation level, shared by the pipeline and the
/// orchestrator's metrics ticker.
#[derive(Debug)]
pub struct LoadMonitor {
    load_bits: AtomicU64,
    level: AtomicU8,
    override_level: AtomicU8,
    last_sample: RwLock<LoadSample>,
}

impl Default for LoadMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadMonitor {
    pub fn new() -> Self {
        Self {
            load_bits: AtomicU64::new(0f64.to_bits()),
            level: AtomicU8::new(DegradationLevel::Normal as u8),
            override_level: AtomicU8::new(NO_OVERRIDE),
            last_sample: RwLock::new(LoadSample::default()),
        }
    }

    pub fn update(&self, sample: LoadSample) -> DegradationLevel {
        *self.last_sample.write() = sample;
        self.set_load(sample.load())
    }

    /// Set L directly. Returns the computed level.
    pub fn set_load(&self, load: f64) -> DegradationLevel {
        let load = load.clamp(0.0, 1.0);
        self.load_bits.store(load.to_bits(), Ordering::Relaxed);
        let next = DegradationLevel::from_load(load);
        let prev = DegradationLevel::from_u8(self.level.swap(next as u8, Ordering::Relaxed));
        if prev != next {
            if next > prev {
                warn!(from = prev.as_str(), to = next.as_str(), load, "Degradation level raised");
            } else {
                info!(from = prev.as_str(), to = next.as_str(), load, "Degradation level lowered");
            }
            metrics::gauge!("fabric_degradation_level", next as u8 as f64);
        }
        next
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.load_bits.load(Ordering::Relaxed))
    }

    pub fn sample(&self) -> LoadSample {
        *self.last_sample.read()
    }

    /// Effective level: the operator override when set, the computed level otherwise.
    pub fn level(&self) -> DegradationLevel {
        match self.override_level.load(Ordering::Relaxed) {
            NO_OVERRIDE => DegradationLevel::from_u8(self.level.load(Ordering::Relaxed)),
            v => DegradationLevel::from_u8(v),
        }
    }

    pub fn set_override(&self, level: Option<DegradationLevel>) {
        let v = level.map(|l| l as u8).unwrap_or(NO_OVERRIDE);
        self.override_level.store(v, Ordering::Relaxed);
        match level {
            Some(l) => warn!(level = l.as_str(), "Degradation level forced"),
            None => info!("Degradation override cleared"),
        }
    }

    pub fn override_level(&self) -> Option<DegradationLevel> {
        match self.override_level.load(Ordering::Relaxed) {
            NO_OVERRIDE => None,
            v => Some(DegradationLevel::from_u8(v)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_boundaries() {
        assert_eq!(DegradationLevel::from_load(0.0), DegradationLevel::Normal);
        assert_eq!(DegradationLevel::from_load(0.5), DegradationLevel::Light);
        assert_eq!(DegradationLevel::from_load(0.69), DegradationLevel::Moderate);
        assert_eq!(DegradationLevel::from_load(0.8), DegradationLevel::Critical);
        assert_eq!(DegradationLevel::from_load(0.9), DegradationLevel::Emergency);
        assert_eq!(DegradationLevel::from_load(1.0), DegradationLevel::Emergency);
    }

    #[test]
    fn test_threshold_non_decreasing_in_load() {
        let mut last = -1;
        for step in 0..=100 {
            let threshold = DegradationLevel::from_load(step as f64 / 100.0).priority_threshold();
            assert!(threshold >= last);
            last = threshold;
        }
    }

    #[test]
    fn test_weighted_load() {
        let sample = LoadSample {
            cpu: 1.0,
            memory: 0.0,
            connections: 1.0,
            latency: 0.0,
        };
        assert!((sample.load() - 0.6).abs() < 1e-9);
        assert_eq!(LoadSample::latency_load(50.0, 50), 0.5);
        assert_eq!(LoadSample::latency_load(500.0, 50), 1.0);
    }

    #[test]
    fn test_override_wins_until_cleared() {
        let monitor = LoadMonitor::new();
        monitor.set_load(0.1);
        monitor.set_override(Some(DegradationLevel::Emergency));
        assert_eq!(monitor.level(), DegradationLevel::Emergency);
        monitor.set_override(None);
        assert_eq!(monitor.level(), DegradationLevel::Normal);
    }
}
