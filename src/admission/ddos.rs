//! DDoS heuristics
//!
//! Volumetric, fingerprint, geographic and periodicity checks. Every trigger
//! raises a per-address threat score that halves every half-life; above the
//! suppression score the origin is rejected outright until it decays.

use parking_lot::Mutex;
use regex::RegexSet;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::rate_limit::{HierarchicalLimiter, RateLimitResult};
use crate::config::{DdosConfig, WindowLevel};
use crate::error::FabricError;
use crate::models::{RequestOrigin, RequestType};

const VOLUMETRIC_WINDOW_MS: u64 = 60_000;
const PERIODICITY_WINDOW: Duration = Duration::from_secs(300);
const PERIODICITY_MIN_SAMPLES: usize = 10;
const PERIODICITY_MAX_SAMPLES: usize = 256;
const PERIODICITY_MAX_CV: f64 = 0.1;
const PERIODICITY_MAX_MEAN: Duration = Duration::from_secs(1);
const ORIGIN_SHARDS: usize = 64;

/// Which heuristic fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Volumetric,
    Fingerprint,
    Geographic,
    Periodicity,
}

impl Trigger {
    pub fn weight(&self) -> f64 {
        match self {
            Trigger::Volumetric => 20.0,
            Trigger::Fingerprint => 15.0,
            Trigger::Geographic => 10.0,
            Trigger::Periodicity => 25.0,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Trigger::Volumetric => "ddos_volumetric",
            Trigger::Fingerprint => "ddos_fingerprint",
            Trigger::Geographic => "ddos_geographic",
            Trigger::Periodicity => "ddos_periodicity",
        }
    }
}

/// Resolves a remote address to a region tag.
pub trait GeoResolver: Send + Sync {
    fn region(&self, addr: &IpAddr) -> Option<String>;
}

/// Resolver over a textual prefix table (`"203.0.113."` → `"xx-region"`).
/// The longest matching prefix wins.
pub struct PrefixGeoResolver {
    prefixes: Vec<(String, String)>,
}

impl PrefixGeoResolver {
    pub fn new(table: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut prefixes: Vec<(String, String)> = table.into_iter().collect();
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { prefixes }
    }
}

impl GeoResolver for PrefixGeoResolver {
    fn region(&self, addr: &IpAddr) -> Option<String> {
        let text = addr.to_string();
        self.prefixes
            .iter()
            .find(|(prefix, _)| text.starts_with(prefix.as_str()))
            .map(|(_, region)| region.clone())
    }
}

#[derive(Debug, Default)]
struct OriginState {
    score: f64,
    score_at: Option<Instant>,
    admitted: u64,
    samples: HashMap<RequestType, VecDeque<Instant>>,
}

impl OriginState {
    fn decayed_score(&self, now: Instant, half_life: Duration) -> f64 {
        match self.score_at {
            None => 0.0,
            Some(at) => {
                let elapsed = now.saturating_duration_since(at).as_secs_f64();
                self.score * 0.5f64.powf(elapsed / half_life.as_secs_f64().max(1.0))
            }
        }
    }

    fn add_score(&mut self, now: Instant, half_life: Duration, weight: f64) -> f64 {
        self.score = self.decayed_score(now, half_life) + weight;
        self.score_at = Some(now);
        self.score
    }
}

/// Interval coefficient of variation and mean, once enough samples exist.
fn interval_stats(samples: &VecDeque<Instant>) -> Option<(f64, Duration)> {
    if samples.len() < PERIODICITY_MIN_SAMPLES {
        return None;
    }
    let intervals: Vec<f64> = samples
        .iter()
        .zip(samples.iter().skip(1))
        .map(|(a, b)| b.saturating_duration_since(*a).as_secs_f64())
        .collect();
    let n = intervals.len() as f64;
    let mean = intervals.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return None;
    }
    let variance = intervals.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    Some((variance.sqrt() / mean, Duration::from_secs_f64(mean)))
}

pub struct DdosScreen {
    config: DdosConfig,
    volumetric: HierarchicalLimiter<IpAddr>,
    fingerprints: RegexSet,
    geo: Box<dyn GeoResolver>,
    origins: Vec<Mutex<HashMap<IpAddr, OriginState>>>,
}

fn origin_shard(addr: &IpAddr) -> usize {
    let mut hasher = DefaultHasher::new();
    addr.hash(&mut hasher);
    (hasher.finish() as usize) % ORIGIN_SHARDS
}

impl DdosScreen {
    pub fn new(config: DdosConfig) -> Self {
        let geo = PrefixGeoResolver::new(
            config
                .geo_prefixes
                .iter()
                .map(|g| (g.prefix.clone(), g.region.clone())),
        );
        Self::with_resolver(config, Box::new(geo))
    }

    pub fn with_resolver(config: DdosConfig, geo: Box<dyn GeoResolver>) -> Self {
        let valid: Vec<&String> = config
            .suspicious_user_agents
            .iter()
            .filter(|p| match regex::Regex::new(p) {
                Ok(_) => true,
                Err(e) => {
                    warn!(pattern = %p, error = %e, "Skipping invalid fingerprint pattern");
                    false
                }
            })
            .collect();
        let fingerprints = RegexSet::new(valid).unwrap_or_else(|_| RegexSet::empty());
        let volumetric = HierarchicalLimiter::new(vec![WindowLevel {
            window_ms: VOLUMETRIC_WINDOW_MS,
            limit: config.volumetric_per_minute,
        }]);
        Self {
            config,
            volumetric,
            fingerprints,
            geo,
            origins: (0..ORIGIN_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn half_life(&self) -> Duration {
        Duration::from_secs(self.config.score_half_life_secs)
    }

    /// Time until a score decays to the suppression level.
    fn suppression_remaining(&self, score: f64) -> Duration {
        let halvings = (score / self.config.suppress_score).log2().max(0.0);
        Duration::from_secs_f64(halvings * self.half_life().as_secs_f64())
    }

    /// Screen one request.
    pub fn screen_at(
        &self,
        origin: &RequestOrigin,
        kind: RequestType,
        now: Instant,
    ) -> Result<(), FabricError> {
        let addr = origin.remote;
        let half_life = self.half_life();
        let mut shard = self.origins[origin_shard(&addr)].lock();
        let state = shard.entry(addr).or_default();

        let score = state.decayed_score(now, half_life);
        if score > self.config.suppress_score {
            metrics::increment_counter!("fabric_ddos_rejected_total", "trigger" => "suppressed");
            return Err(FabricError::too_many(
                "ddos_suppressed",
                self.suppression_remaining(score),
            ));
        }

        let trigger = self.detect(state, origin, kind, now);
        match trigger {
            None => Ok(()),
            Some(trigger) => {
                let score = state.add_score(now, half_life, trigger.weight());
                warn!(
                    remote = %addr,
                    reason = trigger.reason(),
                    score,
                    "DDoS heuristic triggered"
                );
                metrics::increment_counter!("fabric_ddos_rejected_total", "trigger" => trigger.reason());
                let retry_after = if score > self.config.suppress_score {
                    self.suppression_remaining(score)
                } else {
                    Duration::from_millis(crate::error::RETRY_AFTER_TOO_MANY_MS)
                };
                Err(FabricError::too_many(trigger.reason(), retry_after))
            }
        }
    }

    fn detect(
        &self,
        state: &mut OriginState,
        origin: &RequestOrigin,
        kind: RequestType,
        now: Instant,
    ) -> Option<Trigger> {
        if let RateLimitResult::Exceeded { .. } = self.volumetric.check_at(&origin.remote, now) {
            return Some(Trigger::Volumetric);
        }

        if let Some(ua) = origin.user_agent.as_deref() {
            if self.fingerprints.is_match(ua) {
                return Some(Trigger::Fingerprint);
            }
        }

        if state.admitted < self.config.good_standing_after
            && !self.config.high_risk_regions.is_empty()
        {
            if let Some(region) = self.geo.region(&origin.remote) {
                if self.config.high_risk_regions.iter().any(|r| r == &region) {
                    return Some(Trigger::Geographic);
                }
            }
        }

        let samples = state.samples.entry(kind).or_default();
        while let Some(&front) = samples.front() {
            if now.saturating_duration_since(front) > PERIODICITY_WINDOW
                || samples.len() >= PERIODICITY_MAX_SAMPLES
            {
                samples.pop_front();
            } else {
                break;
            }
        }
        samples.push_back(now);
        if let Some((cv, mean)) = interval_stats(samples) {
            if cv < PERIODICITY_MAX_CV && mean < PERIODICITY_MAX_MEAN {
                debug!(remote = %origin.remote, kind = kind.as_str(), cv, "Periodic request pattern");
                samples.clear();
                return Some(Trigger::Periodicity);
            }
        }
        None
    }

    /// Count an admitted request towards the origin's good standing.
    pub fn record_admitted(&self, addr: IpAddr) {
        let mut shard = self.origins[origin_shard(&addr)].lock();
        shard.entry(addr).or_default().admitted += 1;
    }

    pub fn threat_score_at(&self, addr: IpAddr, now: Instant) -> f64 {
        let shard = self.origins[origin_shard(&addr)].lock();
        shard
            .get(&addr)
            .map(|s| s.decayed_score(now, self.half_life()))
            .unwrap_or(0.0)
    }

    pub fn suspicious_origins_at(&self, now: Instant) -> usize {
        let half_life = self.half_life();
        self.origins
            .iter()
            .map(|shard| {
                shard
                    .lock()
                    .values()
                    .filter(|s| s.decayed_score(now, half_life) > 1.0)
                    .count()
            })
            .sum()
    }

    /// Forget origins with no score and no recent samples.
    pub fn cleanup(&self, now: Instant) {
        let half_life = self.half_life();
        for shard in &self.origins {
            shard.lock().retain(|_, s| {
                s.decayed_score(now, half_life) > 0.5
                    || s.admitted >= self.config.good_standing_after
                    || s.samples.values().any(|q| {
                        q.back()
                            .map(|&t| now.saturating_duration_since(t) < PERIODICITY_WINDOW)
                            .unwrap_or(false)
                    })
            });
        }
        self.volumetric.cleanup(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GeoPrefix;
    use std::net::Ipv4Addr;

    fn origin(last: u8) -> RequestOrigin {
        RequestOrigin::anonymous(IpAddr::V4(Ipv4Addr::new(198, 51, 100, last)))
    }

    /// Irregular spacing so periodicity never fires.
    fn jittered(i: u32) -> Duration {
        Duration::from_millis(i as u64 * 700 + (i as u64 * 7919) % 500)
    }

    #[test]
    fn test_volumetric_limit() {
        let screen = DdosScreen::new(DdosConfig {
            volumetric_per_minute: 5,
            ..DdosConfig::default()
        });
        let t0 = Instant::now();
        let o = origin(1);
        for i in 0..5 {
            assert!(screen
                .screen_at(&o, RequestType::Analytics, t0 + jittered(i))
                .is_ok());
        }
        let err = screen
            .screen_at(&o, RequestType::Analytics, t0 + jittered(5))
            .unwrap_err();
        assert_eq!(err.code(), 429);
        assert_eq!(err.reason(), "ddos_volumetric");
        assert!(screen.threat_score_at(o.remote, t0 + jittered(5)) >= 20.0);
    }

    #[test]
    fn test_fingerprint_match() {
        let screen = DdosScreen::new(DdosConfig::default());
        let o = origin(2).with_user_agent("Mozilla/5.0 zgrab/0.x");
        let err = screen
            .screen_at(&o, RequestType::MarketData, Instant::now())
            .unwrap_err();
        assert_eq!(err.reason(), "ddos_fingerprint");

        let ok = origin(3).with_user_agent("Mozilla/5.0 (X11; Linux x86_64)");
        assert!(screen
            .screen_at(&ok, RequestType::MarketData, Instant::now())
            .is_ok());
    }

    #[test]
    fn test_geographic_requires_missing_good_standing() {
        let screen = DdosScreen::new(DdosConfig {
            high_risk_regions: vec!["blocked".into()],
            geo_prefixes: vec![GeoPrefix {
                prefix: "198.51.100.".into(),
                region: "blocked".into(),
            }],
            good_standing_after: 2,
            ..DdosConfig::default()
        });
        let t0 = Instant::now();
        let o = origin(4);
        assert_eq!(
            screen
                .screen_at(&o, RequestType::Analytics, t0)
                .unwrap_err()
                .reason(),
            "ddos_geographic"
        );

        let trusted = origin(5);
        screen.record_admitted(trusted.remote);
        screen.record_admitted(trusted.remote);
        assert!(screen
            .screen_at(&trusted, RequestType::Analytics, t0)
            .is_ok());
    }

    #[test]
    fn test_periodicity_detects_metronome() {
        let screen = DdosScreen::new(DdosConfig::default());
        let t0 = Instant::now();
        let o = origin(6);
        let mut first_reject = None;
        for i in 0..12u64 {
            let at = t0 + Duration::from_millis(i * 200);
            if let Err(e) = screen.screen_at(&o, RequestType::UserCommand, at) {
                assert_eq!(e.reason(), "ddos_periodicity");
                first_reject = Some(i);
                break;
            }
        }
        // Ten samples are needed before the signature can fire.
        assert_eq!(first_reject, Some(9));
    }

    #[test]
    fn test_periodicity_ignores_irregular_traffic() {
        let screen = DdosScreen::new(DdosConfig::default());
        let t0 = Instant::now();
        let o = origin(7);
        for i in 0..40 {
            assert!(screen
                .screen_at(&o, RequestType::UserCommand, t0 + jittered(i))
                .is_ok());
        }
    }

    #[test]
    fn test_score_suppresses_then_decays() {
        let screen = DdosScreen::new(DdosConfig::default());
        let t0 = Instant::now();
        let o = origin(8).with_user_agent("sqlmap/1.7");
        // 15 per trigger: 4 triggers cross 50.
        for _ in 0..4 {
            assert_eq!(
                screen
                    .screen_at(&o, RequestType::Analytics, t0)
                    .unwrap_err()
                    .reason(),
                "ddos_fingerprint"
            );
        }
        let err = screen
            .screen_at(&origin(8), RequestType::Analytics, t0)
            .unwrap_err();
        assert_eq!(err.reason(), "ddos_suppressed");
        assert!(err.retry_after_ms() > 0);

        // 60 halves to 30 after one hour.
        let later = t0 + Duration::from_secs(3_600);
        assert!((screen.threat_score_at(o.remote, later) - 30.0).abs() < 1e-6);
        assert!(screen
            .screen_at(&origin(8), RequestType::Analytics, later)
            .is_ok());
    }
}
