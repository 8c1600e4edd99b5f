//! Consistent-hash ring of virtual nodes.
//!
//! Positions come from SHA-256, so a ring built with `HashRing::new` from the
//! same shard set is identical across processes and restarts. A ring grown
//! with `with_shard_bounded` may give the new shard fewer than the full set of
//! virtual nodes; it then depends on the order shards were added, and only
//! the routing table that holds it (not the shard set) reproduces it.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub type ShardId = u32;

/// Ring position of arbitrary bytes.
pub fn position(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

pub fn key_position(key: &str) -> u64 {
    position(key.as_bytes())
}

fn vnode_position(shard: ShardId, index: u32) -> u64 {
    position(format!("shard-{}#vnode-{}", shard, index).as_bytes())
}

/// Number of sorted positions in the ring arc `(from, to]`.
fn count_in_arc(sorted: &[u64], from: u64, to: u64) -> usize {
    let upto = |p: u64| sorted.partition_point(|&x| x <= p);
    if from < to {
        upto(to) - upto(from)
    } else {
        (sorted.len() - upto(from)) + upto(to)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HashRing {
    vnodes: BTreeMap<u64, ShardId>,
    virtual_nodes: u32,
}

impl HashRing {
    pub fn new(shards: impl IntoIterator<Item = ShardId>, virtual_nodes: u32) -> Self {
        let mut ring = Self {
            vnodes: BTreeMap::new(),
            virtual_nodes: virtual_nodes.max(1),
        };
        for shard in shards {
            ring.insert_all(shard);
        }
        ring
    }

    fn insert_all(&mut self, shard: ShardId) {
        for i in 0..self.virtual_nodes {
            // First writer keeps a colliding position.
            self.vnodes.entry(vnode_position(shard, i)).or_insert(shard);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.vnodes.is_empty()
    }

    pub fn vnode_count(&self) -> usize {
        self.vnodes.len()
    }

    pub fn virtual_nodes(&self) -> u32 {
        self.virtual_nodes
    }

    /// Virtual nodes currently held by `shard`.
    pub fn vnodes_of(&self, shard: ShardId) -> usize {
        self.vnodes.values().filter(|&&s| s == shard).count()
    }

    /// Distinct shards on the ring, ascending.
    pub fn shards(&self) -> Vec<ShardId> {
        let mut shards: Vec<ShardId> = self.vnodes.values().copied().collect();
        shards.sort_unstable();
        shards.dedup();
        shards
    }

    pub fn contains(&self, shard: ShardId) -> bool {
        self.vnodes.values().any(|&s| s == shard)
    }

    pub fn owner_of_position(&self, pos: u64) -> Option<ShardId> {
        self.vnodes
            .range(pos..)
            .next()
            .or_else(|| self.vnodes.iter().next())
            .map(|(_, &s)| s)
    }

    pub fn owner(&self, key: &str) -> Option<ShardId> {
        self.owner_of_position(key_position(key))
    }

    fn predecessor(&self, pos: u64) -> Option<u64> {
        self.vnodes
            .range(..pos)
            .next_back()
            .or_else(|| self.vnodes.iter().next_back())
            .map(|(&p, _)| p)
    }

    /// Ring with `shard` added, taking over at most `max_moves` of the keys at
    /// `key_positions` (sorted ascending). Virtual nodes whose arc would push
    /// the total over the cap are left out. Returns the ring and the number of
    /// keys that change owner.
    pub fn with_shard_bounded(
        &self,
        shard: ShardId,
        key_positions: &[u64],
        max_moves: usize,
    ) -> (HashRing, usize) {
        if self.is_empty() {
            return (
                HashRing::new([shard], self.virtual_nodes),
                key_positions.len(),
            );
        }
        let mut ring = self.clone();
        let mut moved = 0usize;
        for i in 0..self.virtual_nodes {
            let pos = vnode_position(shard, i);
            if ring.vnodes.contains_key(&pos) {
                continue;
            }
            let successor = ring.owner_of_position(pos);
            let gained = match (successor, ring.predecessor(pos)) {
                (Some(owner), _) if owner == shard => 0,
                (_, Some(pred)) => count_in_arc(key_positions, pred, pos),
                _ => 0,
            };
            if moved + gained > max_moves {
                continue;
            }
            moved += gained;
            ring.vnodes.insert(pos, shard);
        }
        (ring, moved)
    }

    pub fn without_shard(&self, shard: ShardId) -> HashRing {
        let mut ring = self.clone();
        ring.vnodes.retain(|_, s| *s != shard);
        ring
    }
}
