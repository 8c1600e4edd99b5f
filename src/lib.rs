//! Econ Fabric
//!
//! Real-time connection and admission fabric for economic simulations:
//! session registry, admission pipeline, sharded replicated store, edge
//! distribution and the orchestrator that wires them together.

pub mod admission;
pub mod compression;
pub mod compute;
pub mod config;
pub mod edge;
pub mod error;
pub mod latency;
pub mod models;
pub mod orchestrator;
pub mod server;
pub mod session;
pub mod store;
pub mod telemetry;

pub use config::FabricConfig;
pub use error::{FabricError, FabricResult, Rejection};
pub use orchestrator::Orchestrator;
