//! Edge Distribution
//!
//! Two-tier cache: regional edge nodes in front of one origin.
//! - `cache`: byte-capped LRU with payload compression
//! - `node`: one regional edge (version floors, health)
//! - `origin`: the authoritative tier
//! - `distribution`: strategies, fetch path, invalidation, steering

pub mod cache;
pub mod distribution;
pub mod node;
pub mod origin;

pub use cache::{CachedPayload, EdgeCache};
pub use distribution::{
    DistributeOptions, DistributionReport, EdgeDistribution, EdgeSettings, FetchSource, Fetched,
    Strategy,
};
pub use node::{EdgeNode, EdgeNodeStats, Lookup};
pub use origin::{Origin, OriginRecord};
