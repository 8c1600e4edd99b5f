//! Latency histogram with logarithmic buckets.
//!
//! Recording is lock-free (atomic bucket counters). Percentiles are read from
//! the bucket upper bounds, so they carry the bucket's relative error.
//! [`LatencyHistogram::take`] reads and clears in one pass, which gives the
//! orchestrator a rolling window per metrics tick.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const NUM_BUCKETS: usize = 24;

/// Bucket upper bounds in microseconds.
static BUCKET_BOUNDS: [u64; NUM_BUCKETS] = [
    1,
    2,
    5,
    10,
    20,
    50,
    100,
    200,
    500,
    1_000,
    2_000,
    5_000,
    10_000,
    20_000,
    30_000,
    50_000,
    75_000,
    100_000,
    200_000,
    500_000,
    1_000_000,
    2_000_000,
    10_000_000,
    u64::MAX,
];

#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; NUM_BUCKETS],
    count: AtomicU64,
    sum_us: AtomicU64,
    max_us: AtomicU64,
}

/// Point-in-time summary, in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

impl LatencySummary {
    pub fn p95_ms(&self) -> f64 {
        self.p95_us as f64 / 1_000.0
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

fn percentile_of(counts: &[u64; NUM_BUCKETS], total: u64, max_us: u64, p: f64) -> u64 {
    if total == 0 {
        return 0;
    }
    let target = ((p / 100.0) * total as f64).ceil().max(1.0) as u64;
    let mut cumulative = 0u64;
    for (i, c) in counts.iter().enumerate() {
        cumulative += c;
        if cumulative >= target {
            // The overflow bucket has no useful bound.
            return BUCKET_BOUNDS[i].min(max_us.max(1));
        }
    }
    max_us
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            buckets: [const { AtomicU64::new(0) }; NUM_BUCKETS],
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record(&self, latency_us: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.max_us.fetch_max(latency_us, Ordering::Relaxed);
        let idx = BUCKET_BOUNDS
            .partition_point(|&bound| bound < latency_us)
            .min(NUM_BUCKETS - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_duration(&self, duration: Duration) {
        self.record(duration.as_micros() as u64);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn percentile(&self, p: f64) -> u64 {
        let counts = self.load_counts();
        let total = counts.iter().sum();
        percentile_of(&counts, total, self.max_us.load(Ordering::Relaxed), p)
    }

    pub fn p95(&self) -> u64 {
        self.percentile(95.0)
    }

    pub fn summary(&self) -> LatencySummary {
        let counts = self.load_counts();
        self.summarize(
            counts,
            self.sum_us.load(Ordering::Relaxed),
            self.max_us.load(Ordering::Relaxed),
        )
    }

    /// Summarize and reset.
    pub fn take(&self) -> LatencySummary {
        let mut counts = [0u64; NUM_BUCKETS];
        for (slot, bucket) in counts.iter_mut().zip(&self.buckets) {
            *slot = bucket.swap(0, Ordering::AcqRel);
        }
        self.count.store(0, Ordering::Relaxed);
        let sum = self.sum_us.swap(0, Ordering::AcqRel);
        let max = self.max_us.swap(0, Ordering::AcqRel);
        self.summarize(counts, sum, max)
    }

    fn load_counts(&self) -> [u64; NUM_BUCKETS] {
        let mut counts = [0u64; NUM_BUCKETS];
        for (slot, bucket) in counts.iter_mut().zip(&self.buckets) {
            *slot = bucket.load(Ordering::Acquire);
        }
        counts
    }

    fn summarize(&self, counts: [u64; NUM_BUCKETS], sum_us: u64, max_us: u64) -> LatencySummary {
        let total: u64 = counts.iter().sum();
        LatencySummary {
            count: total,
            mean_us: if total == 0 {
                0.0
            } else {
                sum_us as f64 / total as f64
            },
            p50_us: percentile_of(&counts, total, max_us, 50.0),
            p95_us: percentile_of(&counts, total, max_us, 95.0),
            p99_us: percentile_of(&counts, total, max_us, 99.0),
            max_us,
        }
    }
}
