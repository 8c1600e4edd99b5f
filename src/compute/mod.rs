//! Compute backends
//!
//! Numerical workloads are opaque to the fabric. The router sends large
//! parallel problems to an accelerated backend when one is registered and
//! enabled, and falls back to the portable (rayon) backend when the
//! accelerated one fails.

pub mod rails;

pub use rails::{HttpRail, InferenceRail, RailRouter};

use async_trait::async_trait;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::FabricConfig;
use crate::error::{FabricError, FabricResult};

/// Element count at which a workload counts as a large parallel problem.
pub const ACCELERATION_THRESHOLD: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "arg", rename_all = "snake_case")]
pub enum Kernel {
    Sum,
    Mean,
    Scale(f64),
    /// Rescale to [0, 1].
    Normalize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    pub name: String,
    pub kernel: Kernel,
    pub data: Vec<f64>,
}

impl Workload {
    pub fn new(name: impl Into<String>, kernel: Kernel, data: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            kernel,
            data,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputeOutput {
    pub backend: &'static str,
    pub values: Vec<f64>,
}

#[async_trait]
pub trait ComputeBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, workload: Workload) -> FabricResult<ComputeOutput>;
}

/// Data-parallel CPU backend on the rayon pool.
#[derive(Debug, Default)]
pub struct PortableBackend;

impl PortableBackend {
    fn execute(kernel: Kernel, data: Vec<f64>) -> Vec<f64> {
        match kernel {
            Kernel::Sum => vec![data.par_iter().sum()],
            Kernel::Mean => {
                if data.is_empty() {
                    vec![0.0]
                } else {
                    vec![data.par_iter().sum::<f64>() / data.len() as f64]
                }
            }
            Kernel::Scale(k) => data.par_iter().map(|x| x * k).collect(),
            Kernel::Normalize => {
                let min = data.par_iter().copied().reduce(|| f64::INFINITY, f64::min);
                let max = data.par_iter().copied().reduce(|| f64::NEG_INFINITY, f64::max);
                let span = max - min;
                if !span.is_finite() || span == 0.0 {
                    vec![0.0; data.len()]
                } else {
                    data.par_iter().map(|x| (x - min) / span).collect()
                }
            }
        }
    }
}

#[async_trait]
impl ComputeBackend for PortableBackend {
    fn name(&self) -> &'static str {
        "portable"
    }

    async fn run(&self, workload: Workload) -> FabricResult<ComputeOutput> {
        let Workload { kernel, data, .. } = workload;
        let values = tokio::task::spawn_blocking(move || Self::execute(kernel, data))
            .await
            .map_err(|e| FabricError::Internal(format!("portable backend task failed: {}", e)))?;
        Ok(ComputeOutput {
            backend: self.name(),
            values,
        })
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ComputeStats {
    pub portable_runs: u64,
    pub accelerated_runs: u64,
    pub fallbacks: u64,
    pub failures: u64,
}

#[derive(Default)]
struct ComputeCounters {
    portable_runs: AtomicU64,
    accelerated_runs: AtomicU64,
    fallbacks: AtomicU64,
    failures: AtomicU64,
}

pub struct ComputeRouter {
    accelerated: Option<Arc<dyn ComputeBackend>>,
    portable: Option<Arc<dyn ComputeBackend>>,
    threshold: usize,
    deadline: Duration,
    counters: ComputeCounters,
}

impl ComputeRouter {
    pub fn new(enable_portable: bool, deadline: Duration) -> Self {
        Self {
            accelerated: None,
            portable: enable_portable.then(|| Arc::new(PortableBackend) as Arc<dyn ComputeBackend>),
            threshold: ACCELERATION_THRESHOLD,
            deadline,
            counters: ComputeCounters::default(),
        }
    }

    pub fn from_config(config: &FabricConfig) -> Self {
        Self::new(config.enable_portable_compute, Duration::from_millis(config.target_latency_ms * 20))
    }

    /// Register the accelerated backend. Ignored unless `enabled`.
    pub fn with_accelerated(mut self, backend: Arc<dyn ComputeBackend>, enabled: bool) -> Self {
        if enabled {
            self.accelerated = Some(backend);
        }
        self
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn has_accelerated(&self) -> bool {
        self.accelerated.is_some()
    }

    async fn run_on(&self, backend: &Arc<dyn ComputeBackend>, workload: Workload) -> FabricResult<ComputeOutput> {
        tokio::time::timeout(self.deadline, backend.run(workload))
            .await
            .unwrap_or(Err(FabricError::Timeout("compute")))
    }

    pub async fn run(&self, workload: Workload) -> FabricResult<ComputeOutput> {
        let large = workload.size() >= self.threshold;
        if let (true, Some(accel)) = (large, &self.accelerated) {
            let fallback_copy = self.portable.as_ref().map(|_| workload.clone());
            match self.run_on(accel, workload).await {
                Ok(out) => {
                    self.counters.accelerated_runs.fetch_add(1, Ordering::Relaxed);
                    return Ok(out);
                }
                Err(err) => match (fallback_copy, &self.portable) {
                    (Some(workload), Some(portable)) => {
                        warn!(backend = accel.name(), error = %err, "Accelerated backend failed, falling back");
                        self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                        metrics::increment_counter!("fabric_compute_fallbacks_total");
                        return self.run_portable(portable, workload).await;
                    }
                    _ => {
                        self.counters.failures.fetch_add(1, Ordering::Relaxed);
                        return Err(err);
                    }
                },
            }
        }

        match &self.portable {
            Some(portable) => self.run_portable(portable, workload).await,
            None => match &self.accelerated {
                Some(accel) => self.run_on(accel, workload).await,
                None => Err(FabricError::unavailable("no_compute_backend")),
            },
        }
    }

    async fn run_portable(&self, portable: &Arc<dyn ComputeBackend>, workload: Workload) -> FabricResult<ComputeOutput> {
        debug!(name = %workload.name, size = workload.size(), "Portable compute");
        let out = self.run_on(portable, workload).await;
        match &out {
            Ok(_) => self.counters.portable_runs.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.counters.failures.fetch_add(1, Ordering::Relaxed),
        };
        out
    }

    pub fn stats(&self) -> ComputeStats {
        let c = &self.counters;
        ComputeStats {
            portable_runs: c.portable_runs.load(Ordering::Relaxed),
            accelerated_runs: c.accelerated_runs.load(Ordering::Relaxed),
            fallbacks: c.fallbacks.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenAccelerator;

    #[async_trait]
    impl ComputeBackend for BrokenAccelerator {
        fn name(&self) -> &'static str {
            "gpu"
        }

        async fn run(&self, _workload: Workload) -> FabricResult<ComputeOutput> {
            Err(FabricError::Internal("device lost".into()))
        }
    }

    struct EchoAccelerator;

    #[async_trait]
    impl ComputeBackend for EchoAccelerator {
        fn name(&self) -> &'static str {
            "gpu"
        }

        async fn run(&self, workload: Workload) -> FabricResult<ComputeOutput> {
            Ok(ComputeOutput {
                backend: "gpu",
                values: vec![workload.size() as f64],
            })
        }
    }

    #[tokio::test]
    async fn test_portable_kernels() {
        let router = ComputeRouter::new(true, Duration::from_secs(5));
        let out = router
            .run(Workload::new("sum", Kernel::Sum, vec![1.0, 2.0, 3.0]))
            .await
            .unwrap();
        assert_eq!(out.values, vec![6.0]);
        assert_eq!(out.backend, "portable");

        let out = router
            .run(Workload::new("norm", Kernel::Normalize, vec![2.0, 4.0, 6.0]))
            .await
            .unwrap();
        assert_eq!(out.values, vec![0.0, 0.5, 1.0]);
    }

    #[tokio::test]
    async fn test_large_problems_use_accelerator() {
        let router = ComputeRouter::new(true, Duration::from_secs(5))
            .with_accelerated(Arc::new(EchoAccelerator), true)
            .with_threshold(4);
        let small = router
            .run(Workload::new("s", Kernel::Sum, vec![1.0; 3]))
            .await
            .unwrap();
        assert_eq!(small.backend, "portable");
        let large = router
            .run(Workload::new("l", Kernel::Sum, vec![1.0; 8]))
            .await
            .unwrap();
        assert_eq!(large.backend, "gpu");
    }

    #[tokio::test]
    async fn test_accelerator_failure_falls_back_silently() {
        let router = ComputeRouter::new(true, Duration::from_secs(5))
            .with_accelerated(Arc::new(BrokenAccelerator), true)
            .with_threshold(1);
        let out = router
            .run(Workload::new("m", Kernel::Mean, vec![2.0, 4.0]))
            .await
            .unwrap();
        assert_eq!(out.values, vec![3.0]);
        assert_eq!(router.stats().fallbacks, 1);
    }

    #[tokio::test]
    async fn test_accelerator_failure_surfaces_without_fallback() {
        let router = ComputeRouter::new(false, Duration::from_secs(5))
            .with_accelerated(Arc::new(BrokenAccelerator), true)
            .with_threshold(1);
        assert!(router
            .run(Workload::new("m", Kernel::Mean, vec![2.0]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_disabled_accelerator_is_ignored() {
        let router = ComputeRouter::new(true, Duration::from_secs(5))
            .with_accelerated(Arc::new(EchoAccelerator), false)
            .with_threshold(1);
        assert!(!router.has_accelerated());
        let out = router
            .run(Workload::new("x", Kernel::Scale(2.0), vec![1.0, 2.0]))
            .await
            .unwrap();
        assert_eq!(out.values, vec![2.0, 4.0]);
    }
}
