//! One regional edge: its cache, per-key version floors and health flag.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::cache::{CachedPayload, EdgeCache};
use super::origin::OriginRecord;
use crate::compression::Compressor;

/// Result of a local lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Fresh(CachedPayload),
    /// Expired but inside the grace window.
    Stale(CachedPayload),
    /// A newer origin version has been announced.
    Outdated(CachedPayload),
    Miss,
}

#[derive(Debug)]
struct NodeState {
    cache: EdgeCache,
    /// Latest origin version announced to this edge.
    announced: HashMap<String, u64>,
    /// Highest invalidated version; nothing at or below it is cached.
    invalidated: HashMap<String, u64>,
    revalidating: HashSet<String>,
}

#[derive(Debug, Default)]
struct NodeCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_served: AtomicU64,
    revalidations: AtomicU64,
    origin_failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeNodeStats {
    pub region: String,
    pub entries: usize,
    pub bytes_used: usize,
    pub capacity_bytes: usize,
    pub evictions: u64,
    pub hits: u64,
    pub misses: u64,
    pub stale_served: u64,
    pub revalidations: u64,
    pub origin_failures: u64,
    pub degraded: bool,
}

#[derive(Debug)]
pub struct EdgeNode {
    region: String,
    grace: Duration,
    state: Mutex<NodeState>,
    degraded: AtomicBool,
    counters: NodeCounters,
}

impl EdgeNode {
    pub fn new(region: impl Into<String>, capacity_bytes: usize, compressor: Compressor, grace: Duration) -> Self {
        Self {
            region: region.into(),
            grace,
            state: Mutex::new(NodeState {
                cache: EdgeCache::new(capacity_bytes, compressor),
                announced: HashMap::new(),
                invalidated: HashMap::new(),
                revalidating: HashSet::new(),
            }),
            degraded: AtomicBool::new(false),
            counters: NodeCounters::default(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub(super) fn mark_origin_failure(&self) {
        self.counters.origin_failures.fetch_add(1, Ordering::Relaxed);
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(region = %self.region, "Edge cannot reach origin, marked degraded");
            metrics::increment_counter!("fabric_edge_degraded_total", "region" => self.region.clone());
        }
    }

    pub(super) fn mark_origin_ok(&self) {
        if self.degraded.swap(false, Ordering::Relaxed) {
            info!(region = %self.region, "Edge reached origin again, degraded flag cleared");
        }
    }

    /// Record that the origin holds `version` of `key`.
    pub fn announce(&self, key: &str, version: u64) {
        let mut state = self.state.lock();
        let entry = state.announced.entry(key.to_string()).or_insert(0);
        *entry = (*entry).max(version);
    }

    /// Store a pushed or fetched payload. Refused at or below the
    /// invalidation floor.
    pub fn store(&self, key: &str, payload: &Bytes, version: u64, expires_at: Instant) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.invalidated.get(key).is_some_and(|&floor| version <= floor) {
            return false;
        }
        let announced = state.announced.entry(key.to_string()).or_insert(0);
        *announced = (*announced).max(version);
        state.cache.insert(key, payload, version, expires_at)
    }

    /// Install an origin response, or extend the expiry if the version is
    /// unchanged.
    pub(super) fn install(&self, key: &str, record: &OriginRecord, expires_at: Instant) {
        let refreshed = self
            .state
            .lock()
            .cache
            .refresh(key, record.version, expires_at);
        if !refreshed {
            self.store(key, &record.payload, record.version, expires_at);
        }
    }

    /// Drop any cached copy at or below `version`. Idempotent, and a lower
    /// version than one already seen has no effect.
    pub fn invalidate(&self, key: &str, version: u64) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let floor = state.invalidated.entry(key.to_string()).or_insert(0);
        *floor = (*floor).max(version);
        let floor = *floor;
        state.cache.remove_through(key, floor);
    }

    pub fn invalidated_through(&self, key: &str) -> u64 {
        self.state.lock().invalidated.get(key).copied().unwrap_or(0)
    }

    pub fn lookup(&self, key: &str, now: Instant) -> Lookup {
        let lookup = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let announced = state.announced.get(key).copied().unwrap_or(0);
            match state.cache.get(key) {
                Some(hit) if hit.expires_at + self.grace < now => {
                    state.cache.remove(key);
                    Lookup::Miss
                }
                Some(hit) if hit.version < announced => Lookup::Outdated(hit),
                Some(hit) if hit.expires_at < now => Lookup::Stale(hit),
                Some(hit) => Lookup::Fresh(hit),
                None => Lookup::Miss,
            }
        };
        match &lookup {
            Lookup::Fresh(_) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                metrics::increment_counter!("fabric_edge_hits_total");
            }
            Lookup::Miss => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                metrics::increment_counter!("fabric_edge_misses_total");
            }
            Lookup::Stale(_) | Lookup::Outdated(_) => {}
        }
        lookup
    }

    pub(super) fn count_stale_served(&self) {
        self.counters.stale_served.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!("fabric_edge_stale_served_total");
    }

    /// Claim the revalidation slot for `key`; `false` if one is running.
    pub(super) fn begin_revalidation(&self, key: &str) -> bool {
        let claimed = self.state.lock().revalidating.insert(key.to_string());
        if claimed {
            self.counters.revalidations.fetch_add(1, Ordering::Relaxed);
        }
        claimed
    }

    pub(super) fn end_revalidation(&self, key: &str) {
        self.state.lock().revalidating.remove(key);
    }

    pub fn cached_version(&self, key: &str) -> Option<u64> {
        self.state.lock().cache.version(key)
    }

    pub fn stats(&self) -> EdgeNodeStats {
        let (entries, bytes_used, capacity_bytes, evictions) = {
            let state = self.state.lock();
            let c = &state.cache;
            (c.len(), c.used_bytes(), c.capacity_bytes(), c.evictions())
        };
        let c = &self.counters;
        EdgeNodeStats {
            region: self.region.clone(),
            entries,
            bytes_used,
            capacity_bytes,
            evictions,
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            stale_served: c.stale_served.load(Ordering::Relaxed),
            revalidations: c.revalidations.load(Ordering::Relaxed),
            origin_failures: c.origin_failures.load(Ordering::Relaxed),
            degraded: self.is_degraded(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> EdgeNode {
        EdgeNode::new("eu-west", 1 << 20, Compressor::new(6, 1024), Duration::from_secs(10))
    }

    #[test]
    fn test_lookup_states() {
        let n = node();
        let now = Instant::now();
        n.store("k", &Bytes::from_static(b"v1"), 1, now + Duration::from_secs(5));
        assert!(matches!(n.lookup("k", now), Lookup::Fresh(_)));
        assert!(matches!(n.lookup("k", now + Duration::from_secs(6)), Lookup::Stale(_)));
        n.announce("k", 2);
        assert!(matches!(n.lookup("k", now), Lookup::Outdated(_)));
        assert_eq!(n.lookup("k", now + Duration::from_secs(20)), Lookup::Miss);
    }

    #[test]
    fn test_invalidation_is_monotonic_and_idempotent() {
        let n = node();
        let later = Instant::now() + Duration::from_secs(60);
        n.store("k", &Bytes::from_static(b"v3"), 3, later);
        n.invalidate("k", 3);
        n.invalidate("k", 3);
        n.invalidate("k", 1);
        assert_eq!(n.invalidated_through("k"), 3);
        assert_eq!(n.cached_version("k"), None);
        assert!(!n.store("k", &Bytes::from_static(b"v2"), 2, later));
        assert!(n.store("k", &Bytes::from_static(b"v4"), 4, later));
    }
}
