//! Origin tier: the single authoritative copy behind the edges.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{FabricError, FabricResult};

#[derive(Debug, Clone, PartialEq)]
pub struct OriginRecord {
    pub payload: Bytes,
    pub version: u64,
}

#[derive(Debug)]
pub struct Origin {
    records: RwLock<HashMap<String, OriginRecord>>,
    reachable: AtomicBool,
    delay_ms: AtomicU64,
}

impl Default for Origin {
    fn default() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            reachable: AtomicBool::new(true),
            delay_ms: AtomicU64::new(0),
        }
    }
}

impl Origin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new payload. With `version` the caller assigns it (public
    /// store keys carry their store version); otherwise the next version is
    /// used. A version at or below the current one is superseded: the
    /// record is left alone and the current version comes back as `Err`.
    pub fn publish(&self, key: &str, payload: Bytes, version: Option<u64>) -> Result<u64, u64> {
        let mut records = self.records.write();
        let current = records.get(key).map(|r| r.version).unwrap_or(0);
        let next = version.unwrap_or(current + 1);
        if next <= current {
            return Err(current);
        }
        records.insert(
            key.to_string(),
            OriginRecord {
                payload,
                version: next,
            },
        );
        Ok(next)
    }

    pub fn version(&self, key: &str) -> u64 {
        self.records.read().get(key).map(|r| r.version).unwrap_or(0)
    }

    pub fn get(&self, key: &str) -> Option<OriginRecord> {
        self.records.read().get(key).cloned()
    }

    /// Fetch as an edge would, over the (simulated) network.
    pub async fn fetch(&self, key: &str) -> FabricResult<Option<OriginRecord>> {
        let delay = self.delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if !self.is_reachable() {
            return Err(FabricError::unavailable("origin_unreachable"));
        }
        Ok(self.get(key))
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Relaxed);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Relaxed)
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
