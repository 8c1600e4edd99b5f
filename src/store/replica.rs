//! In-memory replicas with fault injection.

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::ring::ShardId;
use crate::error::{FabricError, FabricResult};

/// A value with its per-key version. `value == None` is a delete tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub version: u64,
    pub value: Option<Bytes>,
}

impl Versioned {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

#[derive(Debug, Default)]
pub struct Replica {
    data: RwLock<HashMap<String, Versioned>>,
    offline: AtomicBool,
    delay_ms: AtomicU64,
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Relaxed)
    }

    /// Delay applied to every replicated write and read.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    fn delay(&self) -> Option<Duration> {
        match self.delay_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Next version for `key`, applied atomically with the value.
    pub fn bump(&self, key: &str, value: Option<Bytes>) -> u64 {
        let mut data = self.data.write();
        let version = data.get(key).map(|v| v.version).unwrap_or(0) + 1;
        data.insert(key.to_string(), Versioned { version, value });
        version
    }

    /// Apply if newer than what is held. Returns whether it was applied.
    pub fn apply(&self, key: &str, incoming: Versioned) -> bool {
        let mut data = self.data.write();
        match data.get(key) {
            Some(current) if current.version >= incoming.version => false,
            _ => {
                data.insert(key.to_string(), incoming);
                true
            }
        }
    }

    /// Replicate one write, honoring injected faults.
    pub async fn replicate(self: Arc<Self>, key: String, incoming: Versioned) -> FabricResult<()> {
        if let Some(delay) = self.delay() {
            tokio::time::sleep(delay).await;
        }
        if self.is_offline() {
            return Err(FabricError::unavailable("replica_offline"));
        }
        self.apply(&key, incoming);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Versioned> {
        self.data.read().get(key).cloned()
    }

    /// Read honoring injected faults.
    pub async fn read(&self, key: &str) -> FabricResult<Option<Versioned>> {
        if let Some(delay) = self.delay() {
            tokio::time::sleep(delay).await;
        }
        if self.is_offline() {
            return Err(FabricError::unavailable("replica_offline"));
        }
        Ok(self.get(key))
    }

    pub fn version(&self, key: &str) -> u64 {
        self.data.read().get(key).map(|v| v.version).unwrap_or(0)
    }

    pub fn remove(&self, key: &str) {
        self.data.write().remove(key);
    }

    pub fn keys(&self) -> Vec<String> {
        self.data.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One partition: replica 0 is the primary.
#[derive(Debug)]
pub struct Shard {
    pub id: ShardId,
    replicas: Vec<Arc<Replica>>,
}

impl Shard {
    pub fn new(id: ShardId, replication_factor: usize) -> Self {
        Self {
            id,
            replicas: (0..replication_factor.max(1))
                .map(|_| Arc::new(Replica::new()))
                .collect(),
        }
    }

    pub fn primary(&self) -> &Arc<Replica> {
        &self.replicas[0]
    }

    pub fn followers(&self) -> &[Arc<Replica>] {
        &self.replicas[1..]
    }

    pub fn replicas(&self) -> &[Arc<Replica>] {
        &self.replicas
    }

    pub fn replica(&self, index: usize) -> Option<&Arc<Replica>> {
        self.replicas.get(index)
    }

    /// Replicas holding at least `version` of `key`.
    pub fn holders(&self, key: &str, version: u64) -> usize {
        self.replicas
            .iter()
            .filter(|r| r.version(key) >= version)
            .count()
    }

    /// Copy a value onto every replica (rebalancing path).
    pub fn install(&self, key: &str, value: Versioned) {
        for replica in &self.replicas {
            replica.apply(key, value.clone());
        }
    }

    pub fn purge(&self, key: &str) {
        for replica in &self.replicas {
            replica.remove(key);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardStats {
    pub id: ShardId,
    pub keys: usize,
    pub replicas: usize,
    pub offline_replicas: usize,
}

impl Shard {
    pub fn stats(&self) -> ShardStats {
        ShardStats {
            id: self.id,
            keys: self.primary().len(),
            replicas: self.replicas.len(),
            offline_replicas: self.replicas.iter().filter(|r| r.is_offline()).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_highest_version_wins() {
        let r = Replica::new();
        assert!(r.apply(
            "k",
            Versioned {
                version: 3,
                value: Some(Bytes::from_static(b"c"))
            }
        ));
        assert!(!r.apply(
            "k",
            Versioned {
                version: 2,
                value: Some(Bytes::from_static(b"b"))
            }
        ));
        assert_eq!(r.get("k").unwrap().value.unwrap(), Bytes::from_static(b"c"));
        assert_eq!(r.bump("k", None), 4);
        assert!(r.get("k").unwrap().is_tombstone());
    }

    #[tokio::test]
    async fn test_offline_replica_refuses() {
        let r = Arc::new(Replica::new());
        r.set_offline(true);
        let res = r
            .clone()
            .replicate(
                "k".into(),
                Versioned {
                    version: 1,
                    value: None,
                },
            )
            .await;
        assert!(res.is_err());
        assert_eq!(r.version("k"), 0);
    }
}
