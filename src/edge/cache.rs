//! Byte-capped LRU cache held by one edge node.
//!
//! Recency is a monotonically increasing tick; `order` maps tick → key so
//! eviction pops the smallest tick.

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use crate::compression::{decompress, Compressor};

#[derive(Debug, Clone)]
struct Entry {
    data: Bytes,
    compressed: bool,
    raw_len: usize,
    version: u64,
    expires_at: Instant,
    tick: u64,
}

impl Entry {
    fn stored_len(&self) -> usize {
        self.data.len()
    }
}

/// A decoded cache read.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedPayload {
    pub payload: Bytes,
    pub version: u64,
    pub expires_at: Instant,
}

#[derive(Debug)]
pub struct EdgeCache {
    capacity_bytes: usize,
    used_bytes: usize,
    tick: u64,
    entries: HashMap<String, Entry>,
    order: BTreeMap<u64, String>,
    compressor: Compressor,
    evictions: u64,
}

impl EdgeCache {
    pub fn new(capacity_bytes: usize, compressor: Compressor) -> Self {
        Self {
            capacity_bytes,
            used_bytes: 0,
            tick: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            compressor,
            evictions: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Store `payload` at `version`. An equal or newer cached version is kept.
    /// Returns `false` if the entry was not stored.
    pub fn insert(&mut self, key: &str, payload: &Bytes, version: u64, expires_at: Instant) -> bool {
        if let Some(existing) = self.entries.get(key) {
            // One payload per version: an equal version never overwrites.
            if existing.version >= version {
                return false;
            }
        }
        let (data, compressed) = match self.compressor.maybe_compress(payload) {
            Some(packed) => (Bytes::from(packed), true),
            None => (payload.clone(), false),
        };
        if data.len() > self.capacity_bytes {
            return false;
        }
        self.remove(key);
        while self.used_bytes + data.len() > self.capacity_bytes {
            if !self.evict_one() {
                break;
            }
        }
        let tick = self.next_tick();
        self.used_bytes += data.len();
        self.order.insert(tick, key.to_string());
        self.entries.insert(
            key.to_string(),
            Entry {
                data,
                compressed,
                raw_len: payload.len(),
                version,
                expires_at,
                tick,
            },
        );
        true
    }

    fn evict_one(&mut self) -> bool {
        let Some((_, key)) = self.order.pop_first() else {
            return false;
        };
        if let Some(entry) = self.entries.remove(&key) {
            self.used_bytes -= entry.stored_len();
            self.evictions += 1;
        }
        true
    }

    /// Read and mark as most recently used.
    pub fn get(&mut self, key: &str) -> Option<CachedPayload> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        self.order.insert(tick, key.to_string());

        let payload = if entry.compressed {
            match decompress(&entry.data, entry.raw_len) {
                Ok(raw) => Bytes::from(raw),
                Err(_) => {
                    self.remove(key);
                    return None;
                }
            }
        } else {
            entry.data.clone()
        };
        Some(CachedPayload {
            payload,
            version: entry.version,
            expires_at: entry.expires_at,
        })
    }

    pub fn version(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|e| e.version)
    }

    /// Push the expiry of a cached version forward after revalidation.
    pub fn refresh(&mut self, key: &str, version: u64, expires_at: Instant) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) if entry.version == version => {
                entry.expires_at = expires_at;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.order.remove(&entry.tick);
                self.used_bytes -= entry.stored_len();
                true
            }
            None => false,
        }
    }

    /// Drop `key` if its cached version is at most `version`.
    pub fn remove_through(&mut self, key: &str, version: u64) -> bool {
        if self.version(key).is_some_and(|v| v <= version) {
            return self.remove(key);
        }
        false
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cache(cap: usize) -> EdgeCache {
        EdgeCache::new(cap, Compressor::new(6, 1024))
    }

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn test_lru_eviction_respects_byte_cap() {
        let mut c = cache(300);
        for key in ["a", "b", "c"] {
            assert!(c.insert(key, &Bytes::from(vec![1u8; 100]), 1, later()));
        }
        // Touch "a" so "b" is the least recently used.
        assert!(c.get("a").is_some());
        c.insert("d", &Bytes::from(vec![2u8; 100]), 1, later());
        assert!(c.get("b").is_none());
        assert!(c.get("a").is_some());
        assert!(c.used_bytes() <= 300);
        assert_eq!(c.evictions(), 1);
    }

    #[test]
    fn test_compressed_roundtrip_and_accounting() {
        let mut c = cache(1 << 20);
        let payload = Bytes::from(vec![b'x'; 10_000]);
        c.insert("big", &payload, 4, later());
        assert!(c.used_bytes() < 10_000);
        let read = c.get("big").unwrap();
        assert_eq!(read.payload, payload);
        assert_eq!(read.version, 4);
    }

    #[test]
    fn test_older_version_not_stored() {
        let mut c = cache(1 << 20);
        c.insert("k", &Bytes::from_static(b"new"), 5, later());
        assert!(!c.insert("k", &Bytes::from_static(b"old"), 3, later()));
        assert_eq!(c.get("k").unwrap().payload, Bytes::from_static(b"new"));
        assert!(!c.remove_through("k", 4));
        assert!(c.remove_through("k", 5));
        assert!(c.is_empty());
    }

    #[test]
    fn test_equal_version_never_overwrites() {
        let mut c = cache(1 << 20);
        assert!(c.insert("k", &Bytes::from_static(b"first"), 2, later()));
        assert!(!c.insert("k", &Bytes::from_static(b"second"), 2, later()));
        assert_eq!(c.get("k").unwrap().payload, Bytes::from_static(b"first"));
    }
}
