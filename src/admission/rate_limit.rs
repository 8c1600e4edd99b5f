//! Rate limiters.
//!
//! Token bucket, sliding window, hierarchical per-key windows and
//! user-agent pattern buckets. Every check takes an explicit `now` so the
//! pipeline can evaluate all tiers against one timestamp.

use parking_lot::Mutex;
use regex::Regex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::{UserAgentLimit, WindowLevel};

/// Outcome of a limiter check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateLimitResult {
    Allowed { remaining: u64 },
    Exceeded { retry_after: Duration },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }
}

/// Scale factor shared by limiters, stored as f64 bits.
#[derive(Debug)]
pub struct LimitScale(AtomicU64);

impl LimitScale {
    pub fn new() -> Self {
        Self(AtomicU64::new(1.0f64.to_bits()))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, scale: f64) {
        self.0.store(scale.to_bits(), Ordering::Relaxed);
    }
}

impl Default for LimitScale {
    fn default() -> Self {
        Self::new()
    }
}

fn scaled_limit(limit: usize, scale: f64) -> usize {
    ((limit as f64 * scale).round() as usize).max(1)
}

/// Token bucket with real-valued tokens.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self::new_at(capacity, refill_per_sec, Instant::now())
    }

    pub fn new_at(capacity: f64, refill_per_sec: f64, now: Instant) -> Self {
        Self {
            capacity,
            refill_per_sec,
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant, scale: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let capacity = self.capacity * scale;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec * scale).min(capacity);
        self.last_refill = now.max(self.last_refill);
    }

    /// Take one token if available.
    pub fn check_at(&mut self, now: Instant, scale: f64) -> RateLimitResult {
        self.refill(now, scale);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            RateLimitResult::Allowed {
                remaining: self.tokens as u64,
            }
        } else {
            let rate = (self.refill_per_sec * scale).max(f64::MIN_POSITIVE);
            let wait = (1.0 - self.tokens) / rate;
            RateLimitResult::Exceeded {
                retry_after: Duration::from_secs_f64(wait.min(3_600.0)),
            }
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

/// Sliding window over arrival timestamps.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    window: Duration,
    limit: usize,
    arrivals: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(window: Duration, limit: usize) -> Self {
        Self {
            window,
            limit,
            arrivals: VecDeque::new(),
        }
    }

    fn trim(&mut self, now: Instant) {
        while let Some(&oldest) = self.arrivals.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.arrivals.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time until a slot frees up, or `None` if one is free now.
    pub fn retry_after_at(&mut self, now: Instant, scale: f64) -> Option<Duration> {
        self.trim(now);
        let limit = scaled_limit(self.limit, scale);
        if self.arrivals.len() < limit {
            return None;
        }
        // The slot frees when the arrival `len - limit` positions from the front expires.
        let idx = self.arrivals.len() - limit;
        let blocking = self.arrivals[idx];
        Some((blocking + self.window).saturating_duration_since(now))
    }

    pub fn record(&mut self, now: Instant) {
        self.arrivals.push_back(now);
    }

    pub fn check_at(&mut self, now: Instant, scale: f64) -> RateLimitResult {
        match self.retry_after_at(now, scale) {
            Some(retry_after) => RateLimitResult::Exceeded { retry_after },
            None => {
                self.record(now);
                RateLimitResult::Allowed {
                    remaining: scaled_limit(self.limit, scale)
                        .saturating_sub(self.arrivals.len()) as u64,
                }
            }
        }
    }

    pub fn count(&self) -> usize {
        self.arrivals.len()
    }

    pub fn is_idle(&self, now: Instant) -> bool {
        self.arrivals
            .back()
            .map(|&last| now.saturating_duration_since(last) >= self.window)
            .unwrap_or(true)
    }
}

const KEY_SHARDS: usize = 64;

fn shard_of<K: Hash>(key: &K) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % KEY_SHARDS
}

/// Per-key limiter with several window levels evaluated conjunctively.
///
/// Counters are sharded by key hash to keep critical sections short.
pub struct HierarchicalLimiter<K> {
    levels: Vec<WindowLevel>,
    shards: Vec<Mutex<HashMap<K, Vec<SlidingWindow>>>>,
    scale: LimitScale,
}

impl<K: Hash + Eq + Clone> HierarchicalLimiter<K> {
    pub fn new(levels: Vec<WindowLevel>) -> Self {
        Self {
            levels,
            shards: (0..KEY_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            scale: LimitScale::new(),
        }
    }

    /// Admit only if every level has room; admitted requests count against all levels.
    pub fn check_at(&self, key: &K, now: Instant) -> RateLimitResult {
        let scale = self.scale.get();
        let mut shard = self.shards[shard_of(key)].lock();
        let series = shard.entry(key.clone()).or_insert_with(|| {
            self.levels
                .iter()
                .map(|l| SlidingWindow::new(Duration::from_millis(l.window_ms), l.limit))
                .collect()
        });

        let mut worst: Option<Duration> = None;
        for window in series.iter_mut() {
            if let Some(wait) = window.retry_after_at(now, scale) {
                worst = Some(worst.map_or(wait, |w| w.max(wait)));
            }
        }
        if let Some(retry_after) = worst {
            return RateLimitResult::Exceeded { retry_after };
        }

        for window in series.iter_mut() {
            window.record(now);
        }
        let remaining = series
            .iter()
            .zip(&self.levels)
            .map(|(w, l)| scaled_limit(l.limit, scale).saturating_sub(w.count()) as u64)
            .min()
            .unwrap_or(0);
        RateLimitResult::Allowed { remaining }
    }

    pub fn set_scale(&self, scale: f64) {
        self.scale.set(scale);
    }

    /// Drop keys with no activity in their longest window.
    pub fn cleanup(&self, now: Instant) {
        for shard in &self.shards {
            shard
                .lock()
                .retain(|_, series| series.iter().any(|w| !w.is_idle(now)));
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}

/// User-agent buckets; each user agent uses the first pattern it matches.
pub struct PatternLimiter {
    buckets: Vec<(Regex, Mutex<SlidingWindow>)>,
    scale: LimitScale,
}

impl PatternLimiter {
    /// Invalid patterns are skipped with a warning.
    pub fn new(limits: &[UserAgentLimit]) -> Self {
        let buckets = limits
            .iter()
            .filter_map(|l| match Regex::new(&l.pattern) {
                Ok(re) => Some((
                    re,
                    Mutex::new(SlidingWindow::new(
                        Duration::from_millis(l.window_ms),
                        l.limit,
                    )),
                )),
                Err(e) => {
                    tracing::warn!(pattern = %l.pattern, error = %e, "Skipping invalid user-agent pattern");
                    None
                }
            })
            .collect();
        Self {
            buckets,
            scale: LimitScale::new(),
        }
    }

    /// Index of the bucket a user agent falls into.
    pub fn bucket_for(&self, user_agent: &str) -> Option<usize> {
        self.buckets
            .iter()
            .position(|(re, _)| re.is_match(user_agent))
    }

    pub fn check_at(&self, user_agent: &str, now: Instant) -> RateLimitResult {
        match self.bucket_for(user_agent) {
            Some(idx) => self.buckets[idx].1.lock().check_at(now, self.scale.get()),
            None => RateLimitResult::Allowed { remaining: u64::MAX },
        }
    }

    pub fn set_scale(&self, scale: f64) {
        self.scale.set(scale);
    }
}
