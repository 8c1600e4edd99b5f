//! Inference rails: ordered retry across outbound model endpoints, each
//! guarded by its own token bucket.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::admission::rate_limit::{RateLimitResult, TokenBucket};
use crate::error::{FabricError, FabricResult};

#[async_trait]
pub trait InferenceRail: Send + Sync {
    fn name(&self) -> &str;
    async fn infer(&self, request: &Value) -> FabricResult<Value>;
}

/// JSON-over-HTTP rail.
pub struct HttpRail {
    name: String,
    endpoint: String,
    client: Client,
}

impl HttpRail {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, timeout: Duration) -> FabricResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FabricError::Internal(format!("http client: {}", e)))?;
        Ok(Self {
            name: name.into(),
            endpoint: endpoint.into(),
            client,
        })
    }
}

#[async_trait]
impl InferenceRail for HttpRail {
    fn name(&self) -> &str {
        &self.name
    }

    async fn infer(&self, request: &Value) -> FabricResult<Value> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FabricError::Timeout("inference_rail")
                } else {
                    FabricError::Internal(format!("{}: {}", self.name, e))
                }
            })?;
        let status = response.status();
        if status.as_u16() == 429 {
            return Err(FabricError::too_many("rail_rate_limited", Duration::from_secs(1)));
        }
        if !status.is_success() {
            return Err(FabricError::Internal(format!("{} returned {}", self.name, status)));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| FabricError::Internal(format!("{} body: {}", self.name, e)))
    }
}

struct RailSlot {
    rail: Arc<dyn InferenceRail>,
    bucket: Mutex<TokenBucket>,
}

pub struct RailRouter {
    rails: Vec<RailSlot>,
}

impl RailRouter {
    pub fn new() -> Self {
        Self { rails: Vec::new() }
    }

    /// Append a rail; rails are tried in insertion order.
    pub fn with_rail(mut self, rail: Arc<dyn InferenceRail>, burst: f64, per_sec: f64) -> Self {
        self.rails.push(RailSlot {
            rail,
            bucket: Mutex::new(TokenBucket::new(burst, per_sec)),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.rails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rails.is_empty()
    }

    pub async fn infer(&self, request: &Value) -> FabricResult<(String, Value)> {
        self.infer_at(request, Instant::now()).await
    }

    /// First rail with tokens left that answers wins. A rail whose bucket is
    /// empty is skipped without being called.
    pub async fn infer_at(&self, request: &Value, now: Instant) -> FabricResult<(String, Value)> {
        let mut shortest_wait: Option<Duration> = None;
        let mut last_error = None;
        for slot in &self.rails {
            let admitted = slot.bucket.lock().check_at(now, 1.0);
            if let RateLimitResult::Exceeded { retry_after } = admitted {
                debug!(rail = slot.rail.name(), "Rail rate limited, skipping");
                shortest_wait = Some(shortest_wait.map_or(retry_after, |w| w.min(retry_after)));
                continue;
            }
            match slot.rail.infer(request).await {
                Ok(value) => return Ok((slot.rail.name().to_string(), value)),
                Err(err) => {
                    warn!(rail = slot.rail.name(), error = %err, "Rail failed, trying next");
                    metrics::increment_counter!("fabric_rail_failures_total", "rail" => slot.rail.name().to_string());
                    last_error = Some(err);
                }
            }
        }
        match (last_error, shortest_wait) {
            (None, Some(wait)) => Err(FabricError::too_many("rail_rate_limited", wait)),
            (Some(_), _) => Err(FabricError::unavailable("all_rails_failed")),
            (None, None) => Err(FabricError::unavailable("no_rails")),
        }
    }
}

impl Default for RailRouter {
    fn default() -> Self {
        Self::new()
    }
}
