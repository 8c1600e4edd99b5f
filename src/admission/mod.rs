//! Admission pipeline: overload protection in front of every request.
//!
//! - `rate_limit`: token bucket, sliding window, hierarchical and pattern limiters
//! - `ddos`: volumetric, fingerprint, geographic and periodicity heuristics
//! - `breaker`: per-endpoint circuit breakers
//! - `degradation`: load formula and degradation levels
//! - `priority`: scores and priority classes
//! - `queue`: the five priority queues
//! - `pipeline`: the ordered stages
//! - `scheduler`: queue drain and adaptive scaling tickers

pub mod breaker;
pub mod ddos;
pub mod degradation;
pub mod pipeline;
pub mod priority;
pub mod queue;
pub mod rate_limit;
pub mod scheduler;

pub use breaker::{BreakerDecision, BreakerRegistry, CircuitState};
pub use ddos::{DdosScreen, GeoResolver, PrefixGeoResolver};
pub use degradation::{DegradationLevel, LoadMonitor, LoadSample};
pub use pipeline::{Admission, AdmissionPipeline, AdmissionStats, AdmittedRequest};
pub use priority::PriorityClass;
pub use queue::{EnqueueOutcome, PriorityQueues, QueuedRequest};
pub use rate_limit::{RateLimitResult, SlidingWindow, TokenBucket};
pub use scheduler::Dispatcher;
