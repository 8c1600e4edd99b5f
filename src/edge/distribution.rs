//! Edge distribution: origin plus regional edges.
//!
//! `distribute` writes the origin and then pushes or announces the new
//! version according to the strategy. `fetch` serves from the regional
//! edge, revalidating against the origin when an entry has expired or a
//! newer version was announced. An edge that cannot reach the origin keeps
//! serving what it has within the grace window and flags itself degraded.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::node::{EdgeNode, EdgeNodeStats, Lookup};
use super::origin::{Origin, OriginRecord};
use crate::compression::Compressor;
use crate::config::FabricConfig;
use crate::error::{FabricError, FabricResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    PushAll,
    PushNearest,
    PullOnDemand,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::PushAll => "push_all",
            Strategy::PushNearest => "push_nearest",
            Strategy::PullOnDemand => "pull_on_demand",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "push_all" => Some(Strategy::PushAll),
            "push_nearest" => Some(Strategy::PushNearest),
            "pull_on_demand" => Some(Strategy::PullOnDemand),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributeOptions {
    #[serde(default)]
    pub strategy: Strategy,
    /// Target regions for `push_nearest`.
    #[serde(default)]
    pub regions: Vec<String>,
    /// Overrides the configured TTL.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    /// Version assigned by the caller (public store keys).
    #[serde(default)]
    pub version: Option<u64>,
}

impl DistributeOptions {
    pub fn push_all() -> Self {
        Self::default()
    }

    pub fn push_nearest<I, S>(regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            strategy: Strategy::PushNearest,
            regions: regions.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn pull_on_demand() -> Self {
        Self {
            strategy: Strategy::PullOnDemand,
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DistributionReport {
    pub key: String,
    pub version: u64,
    pub strategy: Strategy,
    pub edges_pushed: usize,
    pub edges_announced: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchSource {
    Edge,
    /// Served past expiry while a revalidation runs.
    StaleWhileRevalidate,
    /// Served stale because the origin could not be reached.
    StaleDegraded,
    Origin,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub payload: Bytes,
    pub version: u64,
    pub region: String,
    pub source: FetchSource,
}

#[derive(Debug, Clone)]
pub struct EdgeSettings {
    pub regions: Vec<String>,
    pub cache_bytes: usize,
    pub ttl: Duration,
    pub grace: Duration,
    pub fetch_timeout: Duration,
    pub compression_level: u32,
    pub compression_threshold: usize,
}

impl EdgeSettings {
    pub fn from_config(config: &FabricConfig) -> Self {
        Self {
            regions: config.edge_regions.clone(),
            cache_bytes: config.edge_cache_bytes,
            ttl: Duration::from_millis(config.edge_ttl_ms),
            grace: Duration::from_millis(config.edge_grace_ms),
            fetch_timeout: config.read_timeout(),
            compression_level: config.compression_level,
            compression_threshold: config.compression_threshold_bytes,
        }
    }
}

impl Default for EdgeSettings {
    fn default() -> Self {
        Self::from_config(&FabricConfig::default())
    }
}

pub struct EdgeDistribution {
    settings: EdgeSettings,
    origin: Arc<Origin>,
    nodes: BTreeMap<String, Arc<EdgeNode>>,
}

impl EdgeDistribution {
    pub fn new(settings: EdgeSettings) -> Self {
        let compressor = Compressor::new(settings.compression_level, settings.compression_threshold);
        let nodes = settings
            .regions
            .iter()
            .map(|region| {
                (
                    region.clone(),
                    Arc::new(EdgeNode::new(region.clone(), settings.cache_bytes, compressor, settings.grace)),
                )
            })
            .collect();
        info!(regions = ?settings.regions, cache_bytes = settings.cache_bytes, "Edge distribution ready");
        Self {
            settings,
            origin: Arc::new(Origin::new()),
            nodes,
        }
    }

    pub fn origin(&self) -> &Arc<Origin> {
        &self.origin
    }

    pub fn regions(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn node(&self, region: &str) -> Option<&Arc<EdgeNode>> {
        self.nodes.get(region)
    }

    fn node_or_err(&self, region: &str) -> FabricResult<&Arc<EdgeNode>> {
        self.nodes
            .get(region)
            .ok_or_else(|| FabricError::BadRequest(format!("unknown region {}", region)))
    }

    pub fn distribute(&self, key: &str, payload: Bytes, options: &DistributeOptions) -> FabricResult<DistributionReport> {
        self.distribute_at(key, payload, options, Instant::now())
    }

    pub fn distribute_at(
        &self,
        key: &str,
        payload: Bytes,
        options: &DistributeOptions,
        now: Instant,
    ) -> FabricResult<DistributionReport> {
        if options.strategy == Strategy::PushNearest {
            for region in &options.regions {
                self.node_or_err(region)?;
            }
        }
        // A superseded payload is never pushed; edges only learn the
        // origin's current version.
        let (version, fresh) = match self.origin.publish(key, payload.clone(), options.version) {
            Ok(version) => (version, true),
            Err(current) => (current, false),
        };
        let ttl = options
            .ttl_ms
            .map(Duration::from_millis)
            .unwrap_or(self.settings.ttl);
        let expires_at = now + ttl;

        let mut pushed = 0;
        let mut announced = 0;
        for (region, node) in &self.nodes {
            let push = fresh
                && match options.strategy {
                    Strategy::PushAll => true,
                    Strategy::PushNearest => options.regions.iter().any(|r| r == region),
                    Strategy::PullOnDemand => false,
                };
            if push && node.store(key, &payload, version, expires_at) {
                pushed += 1;
            } else {
                node.announce(key, version);
                announced += 1;
            }
        }
        metrics::increment_counter!("fabric_edge_distributions_total", "strategy" => options.strategy.as_str());
        if !fresh {
            debug!(key, version, requested = ?options.version, "Superseded payload not pushed");
        }
        debug!(key, version, strategy = options.strategy.as_str(), pushed, announced, "Distributed");
        Ok(DistributionReport {
            key: key.to_string(),
            version,
            strategy: options.strategy,
            edges_pushed: pushed,
            edges_announced: announced,
        })
    }

    /// Invalidate every edge's copy of `key` up to the origin's current
    /// version. Returns that version; once this returns, no edge serves an
    /// older one.
    pub fn invalidate(&self, key: &str) -> u64 {
        let version = self.origin.version(key);
        for node in self.nodes.values() {
            node.invalidate(key, version);
        }
        metrics::increment_counter!("fabric_edge_invalidations_total");
        debug!(key, version, "Invalidated");
        version
    }

    pub async fn fetch(&self, key: &str, region: &str) -> FabricResult<Option<Fetched>> {
        self.fetch_at(key, region, Instant::now()).await
    }

    pub async fn fetch_at(&self, key: &str, region: &str, now: Instant) -> FabricResult<Option<Fetched>> {
        let node = self.node_or_err(region)?.clone();
        let served = |payload: Bytes, version: u64, source: FetchSource| Fetched {
            payload,
            version,
            region: region.to_string(),
            source,
        };

        match node.lookup(key, now) {
            Lookup::Fresh(hit) => Ok(Some(served(hit.payload, hit.version, FetchSource::Edge))),
            Lookup::Stale(hit) => {
                self.spawn_revalidation(&node, key);
                node.count_stale_served();
                Ok(Some(served(hit.payload, hit.version, FetchSource::StaleWhileRevalidate)))
            }
            Lookup::Outdated(hit) => match self.fetch_origin(&node, key, now).await {
                Ok(Some(record)) => Ok(Some(served(record.payload, record.version, FetchSource::Origin))),
                Ok(None) => Ok(None),
                Err(_) => {
                    node.count_stale_served();
                    Ok(Some(served(hit.payload, hit.version, FetchSource::StaleDegraded)))
                }
            },
            Lookup::Miss => Ok(self
                .fetch_origin(&node, key, now)
                .await?
                .map(|record| served(record.payload, record.version, FetchSource::Origin))),
        }
    }

    async fn fetch_origin(&self, node: &EdgeNode, key: &str, now: Instant) -> FabricResult<Option<OriginRecord>> {
        let fetched = tokio::time::timeout(self.settings.fetch_timeout, self.origin.fetch(key))
            .await
            .unwrap_or(Err(FabricError::Timeout("edge_fetch")));
        match fetched {
            Ok(record) => {
                node.mark_origin_ok();
                if let Some(record) = &record {
                    node.install(key, record, now + self.settings.ttl);
                }
                Ok(record)
            }
            Err(err) => {
                node.mark_origin_failure();
                Err(err)
            }
        }
    }

    fn spawn_revalidation(&self, node: &Arc<EdgeNode>, key: &str) {
        if !node.begin_revalidation(key) {
            return;
        }
        let node = node.clone();
        let origin = self.origin.clone();
        let key = key.to_string();
        let ttl = self.settings.ttl;
        let timeout = self.settings.fetch_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, origin.fetch(&key)).await {
                Ok(Ok(Some(record))) => {
                    node.mark_origin_ok();
                    node.install(&key, &record, Instant::now() + ttl);
                }
                Ok(Ok(None)) => node.mark_origin_ok(),
                Ok(Err(_)) | Err(_) => node.mark_origin_failure(),
            }
            node.end_revalidation(&key);
        });
    }

    /// `preferred` unless it is degraded, else the first healthy region.
    pub fn healthy_region(&self, preferred: &str) -> Option<String> {
        match self.nodes.get(preferred) {
            Some(node) if !node.is_degraded() => return Some(preferred.to_string()),
            _ => {}
        }
        self.nodes
            .iter()
            .find(|(_, node)| !node.is_degraded())
            .map(|(region, _)| region.clone())
    }

    pub fn degraded_regions(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.is_degraded())
            .map(|(r, _)| r.clone())
            .collect()
    }

    pub fn stats(&self) -> Vec<EdgeNodeStats> {
        self.nodes.values().map(|n| n.stats()).collect()
    }
}
