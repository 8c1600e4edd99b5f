//! Online shard add/remove.
//!
//! A migration computes the target ring up front and the set of keys whose
//! owner changes. Until a key has been copied it keeps routing to its
//! source shard; each step copies a batch under the routing write lock so
//! no write lands between the copy and the flip. The final step swaps the
//! ring and purges the moved keys from their sources.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

use super::replica::{Shard, Versioned};
use super::ring::{key_position, ShardId};
use super::sharded::{ActiveMigration, Routing, ShardedStore};
use crate::error::{FabricError, FabricResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "shard", rename_all = "snake_case")]
pub enum MigrationKind {
    AddShard(ShardId),
    RemoveShard(ShardId),
}

/// Handle for an in-flight migration, advanced with [`ShardedStore::step`].
#[derive(Debug)]
pub struct Migration {
    id: u64,
    pub kind: MigrationKind,
    /// Upper bound on keys moved (adds only).
    pub bound: Option<usize>,
    queue: Vec<String>,
    moved: Vec<(String, ShardId)>,
    finished: bool,
}

impl Migration {
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    pub fn moved(&self) -> usize {
        self.moved.len()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub migration: MigrationKind,
    pub keys_moved: usize,
    pub bound: Option<usize>,
}

/// Freshest copy of `key` held by any replica of `shard`.
fn freshest(shard: &Shard, key: &str) -> Option<Versioned> {
    shard
        .replicas()
        .iter()
        .filter_map(|r| r.get(key))
        .max_by_key(|v| v.version)
}

impl ShardedStore {
    fn ensure_idle(&self) -> FabricResult<()> {
        if self.is_migrating() {
            return Err(FabricError::unavailable("migration_in_progress"));
        }
        Ok(())
    }

    fn install_migration(&self, kind: MigrationKind, target: Routing, pending: Vec<String>, bound: Option<usize>) -> Migration {
        let id = self.next_migration_id.fetch_add(1, Ordering::Relaxed);
        *self.migration.write() = Some(ActiveMigration {
            id,
            target: Arc::new(target),
            pending: pending.iter().cloned().collect::<HashSet<_>>(),
        });
        metrics::gauge!("fabric_store_migration_pending", pending.len() as f64);
        info!(?kind, keys = pending.len(), ?bound, "Migration started");
        Migration {
            id,
            kind,
            bound,
            queue: pending,
            moved: Vec::new(),
            finished: false,
        }
    }

    /// Start adding `shard`. At most ⌈K/(N+1)⌉ keys will move, all onto it.
    pub fn begin_add_shard(&self, shard: ShardId) -> FabricResult<Migration> {
        let _route = self.route_lock.write();
        self.ensure_idle()?;
        let current = self.routing.load_full();
        if current.shards.contains_key(&shard) {
            return Err(FabricError::BadRequest(format!("shard {} already exists", shard)));
        }

        let keys = self.keys();
        let mut positions: Vec<u64> = keys.iter().map(|k| key_position(k)).collect();
        positions.sort_unstable();
        let n = current.shards.len();
        let bound = keys.len().div_ceil(n + 1);
        let (ring, _) = current.ring.with_shard_bounded(shard, &positions, bound);

        let mut pending: Vec<String> = keys
            .into_iter()
            .filter(|k| ring.owner(k) != current.ring.owner(k))
            .collect();
        pending.sort_unstable();

        let mut shards: BTreeMap<ShardId, Arc<Shard>> = current.shards.clone();
        shards.insert(
            shard,
            Arc::new(Shard::new(shard, self.settings.replication_factor)),
        );
        Ok(self.install_migration(
            MigrationKind::AddShard(shard),
            Routing { ring, shards },
            pending,
            Some(bound),
        ))
    }

    /// Start draining `shard` onto its ring successors.
    pub fn begin_remove_shard(&self, shard: ShardId) -> FabricResult<Migration> {
        let _route = self.route_lock.write();
        self.ensure_idle()?;
        let current = self.routing.load_full();
        let Some(leaving) = current.shards.get(&shard).cloned() else {
            return Err(FabricError::BadRequest(format!("unknown shard {}", shard)));
        };
        if current.shards.len() == 1 {
            return Err(FabricError::BadRequest("cannot remove the last shard".into()));
        }

        let ring = current.ring.without_shard(shard);
        let mut shards = current.shards.clone();
        shards.remove(&shard);
        let mut pending = leaving.primary().keys();
        pending.sort_unstable();
        Ok(self.install_migration(
            MigrationKind::RemoveShard(shard),
            Routing { ring, shards },
            pending,
            None,
        ))
    }

    /// Copy up to `batch` keys. Returns `true` once the migration has
    /// completed and the new ring is live.
    pub fn step(&self, migration: &mut Migration, batch: usize) -> FabricResult<bool> {
        if migration.finished {
            return Ok(true);
        }
        let current = self.routing.load_full();
        let take = batch.max(1).min(migration.queue.len());
        let chunk: Vec<String> = migration.queue.drain(..take).collect();

        for key in chunk {
            let _route = self.route_lock.write();
            let mut guard = self.migration.write();
            let active = match guard.as_mut() {
                Some(a) if a.id == migration.id => a,
                _ => return Err(FabricError::Internal("migration no longer active".into())),
            };
            let source = current.shard_for(&key);
            let dest = active.target.shard_for(&key);
            if let (Some(source), Some(dest)) = (source, dest) {
                if let Some(value) = freshest(&source, &key) {
                    dest.install(&key, value);
                }
                migration.moved.push((key.clone(), source.id));
            }
            active.pending.remove(&key);
            self.counters.keys_migrated.fetch_add(1, Ordering::Relaxed);
        }
        metrics::gauge!("fabric_store_migration_pending", migration.queue.len() as f64);
        debug!(remaining = migration.queue.len(), "Migration step");

        if migration.queue.is_empty() {
            self.finish(migration)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn finish(&self, migration: &mut Migration) -> FabricResult<()> {
        let _route = self.route_lock.write();
        let previous = self.routing.load_full();
        let target = match self.migration.read().as_ref() {
            Some(a) if a.id == migration.id => a.target.clone(),
            _ => return Err(FabricError::Internal("migration no longer active".into())),
        };
        // Flip the ring before clearing the migration so routing never sees
        // the old ring without the pending filter.
        self.routing.store(target);
        *self.migration.write() = None;

        for (key, source) in &migration.moved {
            if let Some(shard) = previous.shards.get(source) {
                shard.purge(key);
            }
        }
        migration.finished = true;
        self.counters.migrations_completed.fetch_add(1, Ordering::Relaxed);
        metrics::increment_counter!("fabric_store_migrations_total");
        info!(kind = ?migration.kind, moved = migration.moved.len(), "Migration complete");
        Ok(())
    }

    async fn drive(&self, mut migration: Migration, batch: usize) -> FabricResult<MigrationReport> {
        while !self.step(&mut migration, batch)? {
            tokio::task::yield_now().await;
        }
        Ok(MigrationReport {
            migration: migration.kind,
            keys_moved: migration.moved(),
            bound: migration.bound,
        })
    }

    /// Add `shard` and migrate in batches, yielding between them.
    pub async fn rebalance_add_shard(&self, shard: ShardId, batch: usize) -> FabricResult<MigrationReport> {
        let migration = self.begin_add_shard(shard)?;
        self.drive(migration, batch).await
    }

    pub async fn rebalance_remove_shard(&self, shard: ShardId, batch: usize) -> FabricResult<MigrationReport> {
        let migration = self.begin_remove_shard(shard)?;
        self.drive(migration, batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ReadMode, StoreSettings};
    use bytes::Bytes;
    use std::time::Duration;

    fn store(shards: u32) -> ShardedStore {
        ShardedStore::new(StoreSettings {
            shard_count: shards,
            replication_factor: 2,
            virtual_nodes: 64,
            write_timeout: Duration::from_millis(250),
            read_timeout: Duration::from_millis(100),
        })
    }

    #[tokio::test]
    async fn test_add_shard_moves_bounded_keys_and_keeps_values() {
        let s = store(3);
        for i in 0..300 {
            s.set(&format!("agent:{}", i), Bytes::from(format!("v{}", i)))
                .await
                .unwrap();
        }
        let before: Vec<_> = (0..300)
            .map(|i| s.shard_of(&format!("agent:{}", i)).unwrap())
            .collect();

        let report = s.rebalance_add_shard(3, 16).await.unwrap();
        assert!(report.keys_moved <= 75);
        assert!(report.keys_moved > 0);
        assert!(!s.is_migrating());

        let mut moved = 0;
        for i in 0..300 {
            let key = format!("agent:{}", i);
            let after = s.shard_of(&key).unwrap();
            if after != before[i] {
                assert_eq!(after, 3);
                moved += 1;
            }
            assert_eq!(s.get(&key).await.unwrap(), Some(Bytes::from(format!("v{}", i))));
        }
        assert_eq!(moved, report.keys_moved);
        assert_eq!(s.shard_ids(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_writes_during_migration_are_not_lost() {
        let s = store(2);
        for i in 0..100 {
            s.set(&format!("k{}", i), Bytes::from_static(b"old")).await.unwrap();
        }
        let mut m = s.begin_add_shard(2).unwrap();
        assert!(s.begin_add_shard(5).is_err());

        s.step(&mut m, 3).unwrap();
        for i in 0..100 {
            s.set(&format!("k{}", i), Bytes::from_static(b"new")).await.unwrap();
        }
        while !s.step(&mut m, 3).unwrap() {}

        for i in 0..100 {
            let v = s
                .get_versioned(&format!("k{}", i), ReadMode::Primary)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(v.value, Some(Bytes::from_static(b"new")));
            assert_eq!(v.version, 2);
        }
    }

    #[tokio::test]
    async fn test_remove_shard_drains_onto_survivors() {
        let s = store(3);
        for i in 0..120 {
            s.set(&format!("k{}", i), Bytes::from_static(b"x")).await.unwrap();
        }
        s.rebalance_remove_shard(1, 10).await.unwrap();
        assert_eq!(s.shard_ids(), vec![0, 2]);
        for i in 0..120 {
            let key = format!("k{}", i);
            assert_ne!(s.shard_of(&key), Some(1));
            assert_eq!(s.get(&key).await.unwrap(), Some(Bytes::from_static(b"x")));
        }
        assert_eq!(s.stats().migrations_completed, 1);
    }

    #[test]
    fn test_remove_last_shard_refused() {
        let s = store(1);
        assert!(matches!(
            s.begin_remove_shard(0),
            Err(FabricError::BadRequest(_))
        ));
    }
}
