//! Sharded, replicated key-value store.
//!
//! - `ring`: consistent-hash ring with bounded shard addition
//! - `replica`: versioned replicas with fault injection
//! - `sharded`: routing, quorum writes, read modes, watches
//! - `migration`: online shard add/remove

pub mod migration;
pub mod replica;
pub mod ring;
pub mod sharded;

pub use migration::{Migration, MigrationKind, MigrationReport};
pub use replica::{Replica, Shard, ShardStats, Versioned};
pub use ring::{HashRing, ShardId};
pub use sharded::{
    quorum, ReadMode, ReadSession, ShardedStore, StoreEvent, StoreSettings, StoreStats, Watch,
};
