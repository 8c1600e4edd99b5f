//! Unified metrics: system sampling, the per-second snapshot, the periodic
//! report, and scale-up/scale-down recommendations.

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::System;

use crate::admission::pipeline::AdmissionStats;
use crate::admission::queue::QueueSnapshot;
use crate::compute::ComputeStats;
use crate::edge::EdgeNodeStats;
use crate::latency::LatencySummary;
use crate::session::RegistryStats;
use crate::store::StoreStats;

/// Source of host CPU and memory utilization, each in [0, 1].
pub trait SystemProbe: Send + Sync {
    fn sample(&self) -> (f64, f64);
}

/// Host probe backed by `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe for SysinfoProbe {
    fn sample(&self) -> (f64, f64) {
        let mut sys = self.system.lock();
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let cpus = sys.cpus();
        let cpu = if cpus.is_empty() {
            0.0
        } else {
            cpus.iter().map(|c| c.cpu_usage() as f64).sum::<f64>() / (cpus.len() as f64 * 100.0)
        };
        let memory = match sys.total_memory() {
            0 => 0.0,
            total => sys.used_memory() as f64 / total as f64,
        };
        (cpu.clamp(0.0, 1.0), memory.clamp(0.0, 1.0))
    }
}

/// Fixed readings, for tests and for hosts where sampling is undesirable.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticProbe {
    pub cpu: f64,
    pub memory: f64,
}

impl SystemProbe for StaticProbe {
    fn sample(&self) -> (f64, f64) {
        (self.cpu, self.memory)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: i64,
    pub uptime_secs: f64,
    pub load: f64,
    pub level: crate::admission::DegradationLevel,
    pub cpu: f64,
    pub memory: f64,
    pub connection_utilization: f64,
    /// Request latency over the last window.
    pub latency: LatencySummary,
    pub sessions: RegistryStats,
    pub admission: AdmissionStats,
    pub queues: Vec<QueueSnapshot>,
    pub store: StoreStats,
    pub edges: Vec<EdgeNodeStats>,
    pub compute: ComputeStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    Hold,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScalingRecommendation {
    pub action: ScalingAction,
    pub utilization: f64,
    pub p95_ms: f64,
    pub target_ms: u64,
}

/// Scale up when utilization > 0.8 or p95 exceeds the target; scale down
/// when utilization < 0.3 and p95 is within it.
pub fn recommend(utilization: f64, p95_ms: f64, target_ms: u64) -> ScalingRecommendation {
    let over_target = p95_ms > target_ms as f64;
    let action = if utilization > 0.8 || over_target {
        ScalingAction::ScaleUp
    } else if utilization < 0.3 {
        ScalingAction::ScaleDown
    } else {
        ScalingAction::Hold
    };
    ScalingRecommendation {
        action,
        utilization,
        p95_ms,
        target_ms,
    }
}

/// One-minute performance report.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub timestamp: i64,
    pub uptime_secs: f64,
    pub sessions_active: usize,
    pub admitted: u64,
    pub queued: u64,
    pub rejected: u64,
    pub egress_dropped: u64,
    pub store_writes_ok: u64,
    pub store_writes_failed: u64,
    pub edge_hits: u64,
    pub edge_misses: u64,
    pub latency: LatencySummary,
}

impl PerformanceReport {
    pub fn from_snapshot(snapshot: &MetricsSnapshot, latency: LatencySummary) -> Self {
        Self {
            timestamp: snapshot.timestamp,
            uptime_secs: snapshot.uptime_secs,
            sessions_active: snapshot.sessions.active,
            admitted: snapshot.admission.admitted,
            queued: snapshot.admission.queued,
            rejected: snapshot.admission.rejected,
            egress_dropped: snapshot.sessions.egress_dropped_total,
            store_writes_ok: snapshot.store.writes_ok,
            store_writes_failed: snapshot.store.writes_failed,
            edge_hits: snapshot.edges.iter().map(|e| e.hits).sum(),
            edge_misses: snapshot.edges.iter().map(|e| e.misses).sum(),
            latency,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "uptime={:.0}s sessions={} admitted={} queued={} rejected={} egress_dropped={} \
             store_ok={} store_failed={} edge_hits={} edge_misses={} p50={}us p95={}us p99={}us",
            self.uptime_secs,
            self.sessions_active,
            self.admitted,
            self.queued,
            self.rejected,
            self.egress_dropped,
            self.store_writes_ok,
            self.store_writes_failed,
            self.edge_hits,
            self.edge_misses,
            self.latency.p50_us,
            self.latency.p95_us,
            self.latency.p99_us,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recommendations() {
        assert_eq!(recommend(0.85, 10.0, 50).action, ScalingAction::ScaleUp);
        assert_eq!(recommend(0.5, 60.0, 50).action, ScalingAction::ScaleUp);
        assert_eq!(recommend(0.2, 50.0, 50).action, ScalingAction::ScaleDown);
        assert_eq!(recommend(0.2, 51.0, 50).action, ScalingAction::ScaleUp);
        assert_eq!(recommend(0.5, 10.0, 50).action, ScalingAction::Hold);
    }

    #[test]
    fn test_sysinfo_probe_in_range() {
        let (cpu, memory) = SysinfoProbe::new().sample();
        assert!((0.0..=1.0).contains(&cpu));
        assert!((0.0..=1.0).contains(&memory));
    }
}
