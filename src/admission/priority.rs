//! Request priority scoring and priority classes.

use serde::Serialize;
use std::time::Duration;

use crate::models::{Request, RequestOrigin};

/// Named priority band. Declaration order is dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
    Background = 4,
}

impl PriorityClass {
    pub const ALL: [PriorityClass; 5] = [
        PriorityClass::Critical,
        PriorityClass::High,
        PriorityClass::Medium,
        PriorityClass::Low,
        PriorityClass::Background,
    ];

    pub fn from_score(score: i32) -> Self {
        match score {
            s if s >= 90 => PriorityClass::Critical,
            s if s >= 70 => PriorityClass::High,
            s if s >= 50 => PriorityClass::Medium,
            s if s >= 30 => PriorityClass::Low,
            _ => PriorityClass::Background,
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Batch drained per tick at zero load.
    pub fn base_batch(&self) -> usize {
        match self {
            PriorityClass::Critical => 10,
            PriorityClass::High => 5,
            PriorityClass::Medium => 3,
            PriorityClass::Low => 2,
            PriorityClass::Background => 1,
        }
    }

    /// Age after which a queued entry may be evicted to make room.
    pub fn ttl(&self) -> Duration {
        match self {
            PriorityClass::Critical => Duration::from_secs(5),
            PriorityClass::High => Duration::from_secs(10),
            PriorityClass::Medium => Duration::from_secs(30),
            PriorityClass::Low => Duration::from_secs(60),
            PriorityClass::Background => Duration::from_secs(120),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityClass::Critical => "critical",
            PriorityClass::High => "high",
            PriorityClass::Medium => "medium",
            PriorityClass::Low => "low",
            PriorityClass::Background => "background",
        }
    }
}

pub const URGENT_BONUS: i32 = 15;
pub const REALTIME_BONUS: i32 = 10;
pub const GEO_LATENCY_FACTOR: i32 = 5;

/// Latency hints above this are treated as distant clients and boosted.
const FAR_CLIENT_MS: u32 = 150;
/// Latency hints below this are treated as nearby clients.
const NEAR_CLIENT_MS: u32 = 20;

/// Geographic latency factor derived from the client-measured latency hint.
pub fn geo_latency_factor(latency_hint_ms: Option<u32>) -> i32 {
    match latency_hint_ms {
        Some(ms) if ms > FAR_CLIENT_MS => GEO_LATENCY_FACTOR,
        Some(ms) if ms < NEAR_CLIENT_MS => -GEO_LATENCY_FACTOR,
        _ => 0,
    }
}

/// Priority score in [0, 100].
pub fn score(request: &Request, origin: &RequestOrigin) -> i32 {
    let mut p = request.kind.base_priority() + origin.class.priority_bonus();
    if request.urgent {
        p += URGENT_BONUS;
    }
    if request.realtime {
        p += REALTIME_BONUS;
    }
    p += geo_latency_factor(request.latency_hint_ms);
    p.clamp(0, 100)
}
