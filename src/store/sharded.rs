//! Sharded store
//!
//! Keys are routed through the hash ring to a shard. Writes apply on the
//! primary (which assigns the per-key version), then replicate to the
//! followers in parallel and acknowledge once a quorum holds the version.
//! Reads go to the primary by default; read-heavy mode spreads them over
//! replicas and repairs any stale copy it observes.

use arc_swap::ArcSwap;
use bytes::Bytes;
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::replica::{Replica, Shard, ShardStats, Versioned};
use super::ring::{HashRing, ShardId};
use crate::config::FabricConfig;
use crate::error::{FabricError, FabricResult};

const EVENT_CHANNEL_CAPACITY: usize = 8192;

/// Acknowledgements needed for a write: ⌈(R+1)/2⌉.
pub fn quorum(replication_factor: usize) -> usize {
    (replication_factor + 2) / 2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Primary only (falls back to the freshest live replica if it is down).
    Primary,
    /// Any replica, with read repair against the primary.
    AnyReplica,
    /// Primary read-through under the read deadline, or `Stale`.
    Linearizable,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub shard_count: u32,
    pub replication_factor: usize,
    pub virtual_nodes: u32,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
}

impl StoreSettings {
    pub fn from_config(config: &FabricConfig) -> Self {
        Self {
            shard_count: config.shard_count,
            replication_factor: config.replication_factor,
            virtual_nodes: config.virtual_nodes,
            write_timeout: config.write_timeout(),
            read_timeout: config.read_timeout(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self::from_config(&FabricConfig::default())
    }
}

/// A change published to watchers.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    pub key: String,
    pub version: u64,
    /// `None` for deletes.
    pub value: Option<Bytes>,
    pub shard: ShardId,
}

/// Ring plus the shards it routes to.
pub(super) struct Routing {
    pub ring: HashRing,
    pub shards: BTreeMap<ShardId, Arc<Shard>>,
}

impl Routing {
    pub fn shard_for(&self, key: &str) -> Option<Arc<Shard>> {
        self.ring
            .owner(key)
            .and_then(|id| self.shards.get(&id).cloned())
    }
}

/// Routing state while a migration is in flight.
pub(super) struct ActiveMigration {
    pub id: u64,
    pub target: Arc<Routing>,
    /// Keys not yet copied; they still route to the source.
    pub pending: HashSet<String>,
}

#[derive(Debug, Default)]
pub(super) struct StoreCounters {
    pub writes_ok: AtomicU64,
    pub writes_failed: AtomicU64,
    pub reads: AtomicU64,
    pub read_repairs: AtomicU64,
    pub stale_reads: AtomicU64,
    pub keys_migrated: AtomicU64,
    pub migrations_completed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub shards: Vec<ShardStats>,
    pub replication_factor: usize,
    pub writes_ok: u64,
    pub writes_failed: u64,
    pub reads: u64,
    pub read_repairs: u64,
    pub stale_reads: u64,
    pub keys_migrated: u64,
    pub migrations_completed: u64,
    pub migrating: bool,
}

pub struct ShardedStore {
    pub(super) settings: StoreSettings,
    pub(super) routing: ArcSwap<Routing>,
    pub(super) migration: RwLock<Option<ActiveMigration>>,
    /// Held shared by writers while they route and apply on the primary;
    /// held exclusively by the migrator while it copies and flips a key.
    pub(super) route_lock: RwLock<()>,
    pub(super) next_migration_id: AtomicU64,
    pub(super) counters: StoreCounters,
    events: broadcast::Sender<StoreEvent>,
    read_heavy: AtomicBool,
    read_cursor: AtomicUsize,
}

impl ShardedStore {
    pub fn new(settings: StoreSettings) -> Self {
        let shard_ids: Vec<ShardId> = (0..settings.shard_count.max(1)).collect();
        let ring = HashRing::new(shard_ids.iter().copied(), settings.virtual_nodes);
        let shards = shard_ids
            .iter()
            .map(|&id| (id, Arc::new(Shard::new(id, settings.replication_factor))))
            .collect();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            settings,
            routing: ArcSwap::from_pointee(Routing { ring, shards }),
            migration: RwLock::new(None),
            route_lock: RwLock::new(()),
            next_migration_id: AtomicU64::new(1),
            counters: StoreCounters::default(),
            events,
            read_heavy: AtomicBool::new(false),
            read_cursor: AtomicUsize::new(0),
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn quorum(&self) -> usize {
        quorum(self.settings.replication_factor)
    }

    /// Owning shard of `key`, honoring an in-flight migration.
    pub(super) fn route(&self, key: &str) -> FabricResult<Arc<Shard>> {
        if let Some(m) = self.migration.read().as_ref() {
            if !m.pending.contains(key) {
                if let Some(shard) = m.target.shard_for(key) {
                    return Ok(shard);
                }
            }
        }
        self.routing
            .load()
            .shard_for(key)
            .ok_or_else(|| FabricError::Internal("ring has no shards".into()))
    }

    /// Shard id `key` currently routes to.
    pub fn shard_of(&self, key: &str) -> Option<ShardId> {
        self.route(key).ok().map(|s| s.id)
    }

    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.routing.load().shards.keys().copied().collect()
    }

    pub fn shard(&self, id: ShardId) -> Option<Arc<Shard>> {
        self.routing.load().shards.get(&id).cloned()
    }

    /// A replica handle for fault injection.
    pub fn replica(&self, shard: ShardId, index: usize) -> Option<Arc<Replica>> {
        self.shard(shard).and_then(|s| s.replica(index).cloned())
    }

    pub fn set_read_heavy(&self, read_heavy: bool) {
        self.read_heavy.store(read_heavy, Ordering::Relaxed);
    }

    fn default_read_mode(&self) -> ReadMode {
        if self.read_heavy.load(Ordering::Relaxed) {
            ReadMode::AnyReplica
        } else {
            ReadMode::Primary
        }
    }

    pub async fn set(&self, key: &str, value: Bytes) -> FabricResult<u64> {
        self.write(key, Some(value)).await
    }

    pub async fn delete(&self, key: &str) -> FabricResult<u64> {
        self.write(key, None).await
    }

    async fn write(&self, key: &str, value: Option<Bytes>) -> FabricResult<u64> {
        let (shard, version) = {
            let _route = self.route_lock.read();
            let shard = self.route(key)?;
            let primary = shard.primary();
            if primary.is_offline() {
                self.counters.writes_failed.fetch_add(1, Ordering::Relaxed);
                return Err(FabricError::unavailable("primary_offline"));
            }
            let version = primary.bump(key, value.clone());
            (shard, version)
        };
        let record = Versioned {
            version,
            value: value.clone(),
        };

        let needed = self.quorum().saturating_sub(1);
        let mut pending: FuturesUnordered<_> = shard
            .followers()
            .iter()
            .map(|r| r.clone().replicate(key.to_string(), record.clone()))
            .collect();

        let acks = tokio::time::timeout(self.settings.write_timeout, async {
            let mut acks = 0usize;
            while acks < needed {
                match pending.next().await {
                    Some(Ok(())) => acks += 1,
                    Some(Err(_)) => {}
                    None => break,
                }
            }
            acks
        })
        .await;

        // Stragglers still converge in the background.
        if !pending.is_empty() {
            tokio::spawn(async move { while pending.next().await.is_some() {} });
        }

        match acks {
            Ok(n) if n >= needed => {
                self.counters.writes_ok.fetch_add(1, Ordering::Relaxed);
                metrics::increment_counter!("fabric_store_writes_total", "result" => "ok");
                let _ = self.events.send(StoreEvent {
                    key: key.to_string(),
                    version,
                    value,
                    shard: shard.id,
                });
                Ok(version)
            }
            Ok(n) => {
                self.counters.writes_failed.fetch_add(1, Ordering::Relaxed);
                metrics::increment_counter!("fabric_store_writes_total", "result" => "no_quorum");
                warn!(key, shard = shard.id, acks = n + 1, "Write missed quorum");
                Err(FabricError::Timeout("store_quorum"))
            }
            Err(_) => {
                self.counters.writes_failed.fetch_add(1, Ordering::Relaxed);
                metrics::increment_counter!("fabric_store_writes_total", "result" => "timeout");
                warn!(key, shard = shard.id, "Write quorum wait timed out");
                Err(FabricError::Timeout("store_quorum"))
            }
        }
    }

    /// Value of `key`, or `None` if absent or deleted.
    pub async fn get(&self, key: &str) -> FabricResult<Option<Bytes>> {
        Ok(self
            .get_versioned(key, self.default_read_mode())
            .await?
            .and_then(|v| v.value))
    }

    pub async fn get_versioned(&self, key: &str, mode: ReadMode) -> FabricResult<Option<Versioned>> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        let shard = self.route(key)?;
        match mode {
            ReadMode::Primary => self.read_primary(&shard, key).await,
            ReadMode::AnyReplica => self.read_any(&shard, key).await,
            ReadMode::Linearizable => self.read_linearizable(&shard, key).await,
        }
    }

    async fn read_primary(&self, shard: &Shard, key: &str) -> FabricResult<Option<Versioned>> {
        if let Ok(v) = shard.primary().read(key).await {
            return Ok(v);
        }
        // Primary down: freshest live replica.
        let mut best: Option<Versioned> = None;
        let mut any_live = false;
        for replica in shard.followers() {
            if let Ok(v) = replica.read(key).await {
                any_live = true;
                if v.as_ref().map(|v| v.version) > best.as_ref().map(|b| b.version) {
                    best = v;
                }
            }
        }
        if any_live {
            Ok(best)
        } else {
            Err(FabricError::unavailable("shard_offline"))
        }
    }

    async fn read_any(&self, shard: &Shard, key: &str) -> FabricResult<Option<Versioned>> {
        let replicas = shard.replicas();
        let start = self.read_cursor.fetch_add(1, Ordering::Relaxed);
        let chosen = (0..replicas.len())
            .map(|i| &replicas[(start + i) % replicas.len()])
            .find(|r| !r.is_offline());
        let Some(chosen) = chosen else {
            return Err(FabricError::unavailable("shard_offline"));
        };
        let observed = chosen.read(key).await?;

        let primary = shard.primary();
        if primary.is_offline() || Arc::ptr_eq(chosen, primary) {
            return Ok(observed);
        }
        let authoritative = primary.get(key);
        let observed_version = observed.as_ref().map(|v| v.version).unwrap_or(0);
        match authoritative {
            Some(fresh) if fresh.version > observed_version => {
                chosen.apply(key, fresh.clone());
                self.counters.read_repairs.fetch_add(1, Ordering::Relaxed);
                metrics::increment_counter!("fabric_store_read_repairs_total");
                debug!(key, shard = shard.id, from = observed_version, to = fresh.version, "Read repair");
                Ok(Some(fresh))
            }
            _ => Ok(observed),
        }
    }

    async fn read_linearizable(&self, shard: &Shard, key: &str) -> FabricResult<Option<Versioned>> {
        let primary = shard.primary();
        match tokio::time::timeout(self.settings.read_timeout, primary.read(key)).await {
            Ok(Ok(v)) => Ok(v),
            _ => {
                self.counters.stale_reads.fetch_add(1, Ordering::Relaxed);
                metrics::increment_counter!("fabric_store_stale_reads_total");
                Err(FabricError::Stale {
                    key: key.to_string(),
                })
            }
        }
    }

    /// Subscribe to changes of keys starting with `prefix`.
    pub fn watch(&self, prefix: impl Into<String>) -> Watch {
        Watch {
            prefix: prefix.into(),
            rx: self.events.subscribe(),
        }
    }

    /// Monotonic-read view for one client session.
    pub fn read_session(&self) -> ReadSession<'_> {
        ReadSession {
            store: self,
            seen: HashMap::new(),
        }
    }

    /// Replicas of the owning shard that hold at least `version` of `key`.
    pub fn replicas_holding(&self, key: &str, version: u64) -> usize {
        self.route(key)
            .map(|s| s.holders(key, version))
            .unwrap_or(0)
    }

    /// Every key on the primaries, including tombstones.
    pub fn keys(&self) -> Vec<String> {
        let routing = self.routing.load();
        let mut keys = Vec::new();
        for shard in routing.shards.values() {
            keys.extend(shard.primary().keys());
        }
        keys
    }

    pub fn is_migrating(&self) -> bool {
        self.migration.read().is_some()
    }

    pub fn stats(&self) -> StoreStats {
        let routing = self.routing.load();
        let c = &self.counters;
        StoreStats {
            shards: routing.shards.values().map(|s| s.stats()).collect(),
            replication_factor: self.settings.replication_factor,
            writes_ok: c.writes_ok.load(Ordering::Relaxed),
            writes_failed: c.writes_failed.load(Ordering::Relaxed),
            reads: c.reads.load(Ordering::Relaxed),
            read_repairs: c.read_repairs.load(Ordering::Relaxed),
            stale_reads: c.stale_reads.load(Ordering::Relaxed),
            keys_migrated: c.keys_migrated.load(Ordering::Relaxed),
            migrations_completed: c.migrations_completed.load(Ordering::Relaxed),
            migrating: self.is_migrating(),
        }
    }
}

/// Prefix-filtered change stream.
pub struct Watch {
    prefix: String,
    rx: broadcast::Receiver<StoreEvent>,
}

impl Watch {
    /// Next matching event; `None` once the store is gone. Lagged events are skipped.
    pub async fn next(&mut self) -> Option<StoreEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.key.starts_with(&self.prefix) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(prefix = %self.prefix, skipped = n, "Watcher lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Tracks the highest version observed per key so reads never go backwards.
pub struct ReadSession<'a> {
    store: &'a ShardedStore,
    seen: HashMap<String, u64>,
}

impl ReadSession<'_> {
    pub async fn get(&mut self, key: &str) -> FabricResult<Option<Versioned>> {
        self.get_with(key, self.store.default_read_mode()).await
    }

    pub async fn get_with(&mut self, key: &str, mode: ReadMode) -> FabricResult<Option<Versioned>> {
        let floor = self.seen.get(key).copied().unwrap_or(0);
        let mut read = self.store.get_versioned(key, mode).await?;
        if read.as_ref().map(|v| v.version).unwrap_or(0) < floor {
            read = self.store.get_versioned(key, ReadMode::Primary).await?;
        }
        let version = read.as_ref().map(|v| v.version).unwrap_or(0);
        if version < floor {
            return Err(FabricError::Stale {
                key: key.to_string(),
            });
        }
        self.seen.insert(key.to_string(), version);
        Ok(read)
    }

    /// Record a version this session wrote itself.
    pub fn observe(&mut self, key: &str, version: u64) {
        let entry = self.seen.entry(key.to_string()).or_insert(0);
        *entry = (*entry).max(version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(shards: u32, replicas: usize) -> ShardedStore {
        ShardedStore::new(StoreSettings {
            shard_count: shards,
            replication_factor: replicas,
            virtual_nodes: 64,
            write_timeout: Duration::from_millis(250),
            read_timeout: Duration::from_millis(100),
        })
    }

    #[test]
    fn test_quorum_sizes() {
        assert_eq!(quorum(1), 1);
        assert_eq!(quorum(2), 2);
        assert_eq!(quorum(3), 2);
        assert_eq!(quorum(4), 3);
        assert_eq!(quorum(5), 3);
    }

    #[tokio::test]
    async fn test_set_get_delete_versions() {
        let s = store(4, 3);
        assert_eq!(s.set("a", Bytes::from_static(b"1")).await.unwrap(), 1);
        assert_eq!(s.set("a", Bytes::from_static(b"2")).await.unwrap(), 2);
        assert_eq!(s.get("a").await.unwrap(), Some(Bytes::from_static(b"2")));
        assert_eq!(s.delete("a").await.unwrap(), 3);
        assert_eq!(s.get("a").await.unwrap(), None);
        let v = s.get_versioned("a", ReadMode::Primary).await.unwrap().unwrap();
        assert_eq!(v.version, 3);
        assert!(v.is_tombstone());
    }

    #[tokio::test]
    async fn test_quorum_with_one_replica_down() {
        let s = store(1, 3);
        s.replica(0, 2).unwrap().set_offline(true);
        let version = s.set("k", Bytes::from_static(b"v")).await.unwrap();
        assert!(s.replicas_holding("k", version) >= 2);
    }

    #[tokio::test]
    async fn test_quorum_failure_reports_timeout() {
        let s = store(1, 3);
        s.replica(0, 1).unwrap().set_offline(true);
        s.replica(0, 2).unwrap().set_offline(true);
        let err = s.set("k", Bytes::from_static(b"v")).await.unwrap_err();
        assert_eq!(err, FabricError::Timeout("store_quorum"));
        assert_eq!(s.stats().writes_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_replicas_time_out() {
        let s = store(1, 3);
        s.replica(0, 1).unwrap().set_delay(Duration::from_secs(1));
        s.replica(0, 2).unwrap().set_delay(Duration::from_secs(1));
        let err = s.set("k", Bytes::from_static(b"v")).await.unwrap_err();
        assert_eq!(err.code(), 503);
    }

    #[tokio::test]
    async fn test_read_repair_on_stale_replica() {
        let s = store(1, 3);
        let lagging = s.replica(0, 1).unwrap();
        lagging.set_offline(true);
        s.set("k", Bytes::from_static(b"v1")).await.unwrap();
        lagging.set_offline(false);
        assert_eq!(lagging.version("k"), 0);

        for _ in 0..3 {
            let v = s
                .get_versioned("k", ReadMode::AnyReplica)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(v.version, 1);
        }
        assert_eq!(lagging.version("k"), 1);
        assert!(s.stats().read_repairs >= 1);
    }

    #[tokio::test]
    async fn test_linearizable_read_stale_when_primary_down() {
        let s = store(1, 3);
        s.set("k", Bytes::from_static(b"v")).await.unwrap();
        s.replica(0, 0).unwrap().set_offline(true);
        let err = s.get_versioned("k", ReadMode::Linearizable).await.unwrap_err();
        assert_eq!(
            err,
            FabricError::Stale {
                key: "k".to_string()
            }
        );
        // Default reads still succeed from a replica.
        assert_eq!(s.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
    }

    #[tokio::test]
    async fn test_watch_prefix() {
        let s = store(2, 1);
        let mut watch = s.watch("agent:");
        s.set("market:x", Bytes::from_static(b"m")).await.unwrap();
        s.set("agent:7", Bytes::from_static(b"a")).await.unwrap();
        let event = watch.next().await.unwrap();
        assert_eq!(event.key, "agent:7");
        assert_eq!(event.version, 1);
    }

    #[tokio::test]
    async fn test_read_session_is_monotonic() {
        let s = store(1, 3);
        s.set("k", Bytes::from_static(b"v1")).await.unwrap();
        let lagging = s.replica(0, 2).unwrap();
        lagging.set_offline(true);
        s.set("k", Bytes::from_static(b"v2")).await.unwrap();
        lagging.set_offline(false);

        let mut session = s.read_session();
        let first = session.get_with("k", ReadMode::Primary).await.unwrap().unwrap();
        assert_eq!(first.version, 2);
        for _ in 0..6 {
            let v = session
                .get_with("k", ReadMode::AnyReplica)
                .await
                .unwrap()
                .unwrap();
            assert!(v.version >= 2);
        }
    }
}
