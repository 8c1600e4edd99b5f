//! Fabric configuration
//!
//! Enumerated options with defaults, loaded from TOML and overridden by
//! `FABRIC_*` environment variables.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for one fabric instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FabricConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Worker contexts (tokio worker threads). 0 = available parallelism.
    #[serde(default)]
    pub workers: usize,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_target_latency_ms")]
    pub target_latency_ms: u64,

    #[serde(default = "default_shard_count")]
    pub shard_count: u32,

    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,

    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: u32,

    /// Quorum wait deadline for store writes.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Deadline for linearizable reads and edge origin fetches.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    #[serde(default)]
    pub enable_gpu: bool,

    #[serde(default = "default_true")]
    pub enable_portable_compute: bool,

    #[serde(default = "default_true")]
    pub enable_edge: bool,

    #[serde(default = "default_true")]
    pub enable_admission: bool,

    #[serde(default = "default_true")]
    pub ddos_enabled: bool,

    #[serde(default = "default_true")]
    pub adaptive_scaling_enabled: bool,

    #[serde(default = "default_edge_cache_bytes")]
    pub edge_cache_bytes: usize,

    #[serde(default = "default_edge_regions")]
    pub edge_regions: Vec<String>,

    #[serde(default = "default_edge_ttl_ms")]
    pub edge_ttl_ms: u64,

    #[serde(default = "default_edge_grace_ms")]
    pub edge_grace_ms: u64,

    /// Deflate level, 0-9.
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: usize,

    #[serde(default = "default_compression_concurrency")]
    pub compression_concurrency: usize,

    #[serde(default = "default_heartbeat_period_ms")]
    pub heartbeat_period_ms: u64,

    #[serde(default = "default_egress_buffer_frames")]
    pub egress_buffer_frames: usize,

    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    #[serde(default)]
    pub limits: LimitConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub ddos: DdosConfig,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_max_connections() -> usize {
    100_000
}
fn default_target_latency_ms() -> u64 {
    50
}
fn default_shard_count() -> u32 {
    16
}
fn default_replication_factor() -> usize {
    3
}
fn default_virtual_nodes() -> u32 {
    128
}
fn default_write_timeout_ms() -> u64 {
    250
}
fn default_read_timeout_ms() -> u64 {
    100
}
fn default_true() -> bool {
    true
}
fn default_edge_cache_bytes() -> usize {
    2 * 1024 * 1024 * 1024
}
fn default_edge_regions() -> Vec<String> {
    vec![
        "us-east".to_string(),
        "eu-west".to_string(),
        "ap-southeast".to_string(),
    ]
}
fn default_edge_ttl_ms() -> u64 {
    30_000
}
fn default_edge_grace_ms() -> u64 {
    120_000
}
fn default_compression_level() -> u32 {
    6
}
fn default_compression_threshold() -> usize {
    1024
}
fn default_compression_concurrency() -> usize {
    64
}
fn default_heartbeat_period_ms() -> u64 {
    30_000
}
fn default_egress_buffer_frames() -> usize {
    1024
}
fn default_max_payload_bytes() -> usize {
    1024 * 1024
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            workers: 0,
            max_connections: default_max_connections(),
            target_latency_ms: default_target_latency_ms(),
            shard_count: default_shard_count(),
            replication_factor: default_replication_factor(),
            virtual_nodes: default_virtual_nodes(),
            write_timeout_ms: default_write_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            enable_gpu: false,
            enable_portable_compute: true,
            enable_edge: true,
            enable_admission: true,
            ddos_enabled: true,
            adaptive_scaling_enabled: true,
            edge_cache_bytes: default_edge_cache_bytes(),
            edge_regions: default_edge_regions(),
            edge_ttl_ms: default_edge_ttl_ms(),
            edge_grace_ms: default_edge_grace_ms(),
            compression_level: default_compression_level(),
            compression_threshold_bytes: default_compression_threshold(),
            compression_concurrency: default_compression_concurrency(),
            heartbeat_period_ms: default_heartbeat_period_ms(),
            egress_buffer_frames: default_egress_buffer_frames(),
            max_payload_bytes: default_max_payload_bytes(),
            limits: LimitConfig::default(),
            breaker: BreakerConfig::default(),
            ddos: DdosConfig::default(),
        }
    }
}

impl FabricConfig {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Load from `FABRIC_CONFIG` (if set), then apply environment overrides.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = match std::env::var("FABRIC_CONFIG") {
            Ok(path) => Self::load(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `FABRIC_*` environment variables on top of the current values.
    pub fn apply_env_overrides(&mut self) {
        fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
        }
        fn env_flag(name: &str) -> Option<bool> {
            std::env::var(name)
                .ok()
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        }

        if let Ok(v) = std::env::var("FABRIC_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = env_parse("FABRIC_WORKERS") {
            self.workers = v;
        }
        if let Some(v) = env_parse("FABRIC_MAX_CONNECTIONS") {
            self.max_connections = v;
        }
        if let Some(v) = env_parse("FABRIC_TARGET_LATENCY_MS") {
            self.target_latency_ms = v;
        }
        if let Some(v) = env_parse("FABRIC_SHARD_COUNT") {
            self.shard_count = v;
        }
        if let Some(v) = env_parse("FABRIC_REPLICATION_FACTOR") {
            self.replication_factor = v;
        }
        if let Some(v) = env_parse("FABRIC_WRITE_TIMEOUT_MS") {
            self.write_timeout_ms = v;
        }
        if let Some(v) = env_flag("FABRIC_ENABLE_GPU") {
            self.enable_gpu = v;
        }
        if let Some(v) = env_flag("FABRIC_ENABLE_PORTABLE_COMPUTE") {
            self.enable_portable_compute = v;
        }
        if let Some(v) = env_flag("FABRIC_ENABLE_EDGE") {
            self.enable_edge = v;
        }
        if let Some(v) = env_flag("FABRIC_ENABLE_ADMISSION") {
            self.enable_admission = v;
        }
        if let Some(v) = env_flag("FABRIC_DDOS_ENABLED") {
            self.ddos_enabled = v;
        }
        if let Some(v) = env_flag("FABRIC_ADAPTIVE_SCALING_ENABLED") {
            self.adaptive_scaling_enabled = v;
        }
        if let Some(v) = env_parse("FABRIC_EDGE_CACHE_BYTES") {
            self.edge_cache_bytes = v;
        }
        if let Some(v) = env_parse("FABRIC_COMPRESSION_LEVEL") {
            self.compression_level = v;
        }
        if let Some(v) = env_parse("FABRIC_HEARTBEAT_PERIOD_MS") {
            self.heartbeat_period_ms = v;
        }
    }

    /// Reject combinations the fabric cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.shard_count == 0 {
            bail!("shardCount must be at least 1");
        }
        if self.replication_factor == 0 {
            bail!("replicationFactor must be at least 1");
        }
        if self.virtual_nodes == 0 {
            bail!("virtualNodes must be at least 1");
        }
        if self.compression_level > 9 {
            bail!("compressionLevel must be in 0..=9, got {}", self.compression_level);
        }
        if self.max_connections == 0 {
            bail!("maxConnections must be at least 1");
        }
        if self.heartbeat_period_ms == 0 {
            bail!("heartbeatPeriodMs must be positive");
        }
        if self.enable_edge && self.edge_regions.is_empty() {
            bail!("enableEdge requires at least one edge region");
        }
        Ok(())
    }

    /// Worker contexts to run, resolving 0 to the host's parallelism.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Rate-limit tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitConfig {
    /// Global connection token bucket: refill per second.
    #[serde(default = "default_connection_rate")]
    pub global_connection_rate: f64,
    /// Global connection token bucket: capacity.
    #[serde(default = "default_connection_burst")]
    pub global_connection_burst: f64,
    /// Global request sliding window: limit.
    #[serde(default = "default_request_limit")]
    pub global_request_limit: usize,
    #[serde(default = "default_request_window_ms")]
    pub global_request_window_ms: u64,
    /// Per-remote-address levels, evaluated conjunctively.
    #[serde(default = "default_address_levels")]
    pub address_levels: Vec<WindowLevel>,
    /// User-agent buckets; first matching pattern wins.
    #[serde(default = "default_user_agent_limits")]
    pub user_agent_limits: Vec<UserAgentLimit>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowLevel {
    pub window_ms: u64,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAgentLimit {
    pub pattern: String,
    pub limit: usize,
    pub window_ms: u64,
}

fn default_connection_rate() -> f64 {
    1_000.0
}
fn default_connection_burst() -> f64 {
    5_000.0
}
fn default_request_limit() -> usize {
    200_000
}
fn default_request_window_ms() -> u64 {
    1_000
}
fn default_address_levels() -> Vec<WindowLevel> {
    vec![
        WindowLevel {
            window_ms: 1_000,
            limit: 1_000,
        },
        WindowLevel {
            window_ms: 60_000,
            limit: 10_000,
        },
        WindowLevel {
            window_ms: 3_600_000,
            limit: 100_000,
        },
    ]
}
fn default_user_agent_limits() -> Vec<UserAgentLimit> {
    vec![
        UserAgentLimit {
            pattern: "(?i)(bot|crawler|spider)".to_string(),
            limit: 60,
            window_ms: 60_000,
        },
        UserAgentLimit {
            pattern: "(?i)(curl|wget|python-requests|go-http-client)".to_string(),
            limit: 600,
            window_ms: 60_000,
        },
    ]
}
fn default_queue_capacity() -> usize {
    10_000
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            global_connection_rate: default_connection_rate(),
            global_connection_burst: default_connection_burst(),
            global_request_limit: default_request_limit(),
            global_request_window_ms: default_request_window_ms(),
            address_levels: default_address_levels(),
            user_agent_limits: default_user_agent_limits(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Circuit breaker defaults applied to every endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_open_ms")]
    pub open_ms: u64,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_open_ms() -> u64 {
    30_000
}
fn default_success_threshold() -> u32 {
    3
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_ms: default_open_ms(),
            success_threshold: default_success_threshold(),
        }
    }
}

/// DDoS heuristic tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DdosConfig {
    #[serde(default = "default_volumetric_limit")]
    pub volumetric_per_minute: usize,
    #[serde(default = "default_suspicious_agents")]
    pub suspicious_user_agents: Vec<String>,
    /// Regions treated as high risk for origins without good standing.
    #[serde(default)]
    pub high_risk_regions: Vec<String>,
    /// Address-prefix to region table used by the built-in resolver.
    #[serde(default)]
    pub geo_prefixes: Vec<GeoPrefix>,
    #[serde(default = "default_suppress_score")]
    pub suppress_score: f64,
    #[serde(default = "default_score_half_life_secs")]
    pub score_half_life_secs: u64,
    /// Admitted requests before an origin is in good standing.
    #[serde(default = "default_good_standing_after")]
    pub good_standing_after: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeoPrefix {
    pub prefix: String,
    pub region: String,
}

fn default_volumetric_limit() -> usize {
    6_000
}
fn default_suspicious_agents() -> Vec<String> {
    vec![
        "(?i)masscan".to_string(),
        "(?i)nikto".to_string(),
        "(?i)sqlmap".to_string(),
        "(?i)zgrab".to_string(),
    ]
}
fn default_suppress_score() -> f64 {
    50.0
}
fn default_score_half_life_secs() -> u64 {
    3_600
}
fn default_good_standing_after() -> u64 {
    100
}

impl Default for DdosConfig {
    fn default() -> Self {
        Self {
            volumetric_per_minute: default_volumetric_limit(),
            suspicious_user_agents: default_suspicious_agents(),
            high_risk_regions: Vec::new(),
            geo_prefixes: Vec::new(),
            suppress_score: default_suppress_score(),
            score_half_life_secs: default_score_half_life_secs(),
            good_standing_after: default_good_standing_after(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_enumerated_options() {
        let config = FabricConfig::default();
        assert_eq!(config.max_connections, 100_000);
        assert_eq!(config.target_latency_ms, 50);
        assert_eq!(config.shard_count, 16);
        assert_eq!(config.replication_factor, 3);
        assert_eq!(config.heartbeat_period_ms, 30_000);
        assert_eq!(config.edge_cache_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.limits.address_levels.len(), 3);
        assert_eq!(config.breaker.success_threshold, 3);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
maxConnections = 10
shardCount = 4
ddosEnabled = false

[breaker]
failureThreshold = 2
"#
        )
        .unwrap();

        let config = FabricConfig::load(file.path()).unwrap();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.shard_count, 4);
        assert!(!config.ddos_enabled);
        assert_eq!(config.breaker.failure_threshold, 2);
        assert_eq!(config.breaker.open_ms, 30_000);
        assert_eq!(config.replication_factor, 3);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = FabricConfig::default();
        config.compression_level = 12;
        assert!(config.validate().is_err());

        let mut config = FabricConfig::default();
        config.shard_count = 0;
        assert!(config.validate().is_err());
    }
}
