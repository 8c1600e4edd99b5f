//! Fabric server binary.
//!
//! Usage:
//!   fabric --config fabric.toml --bind 0.0.0.0:8080 --workers 8
//!
//! Environment:
//!   FABRIC_CONFIG - TOML config file
//!   FABRIC_* - per-option overrides (see `FabricConfig::apply_env_overrides`)
//!   RUST_LOG - tracing filter (default: econ_fabric=info,tower_http=info)

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use econ_fabric::config::FabricConfig;
use econ_fabric::orchestrator::Orchestrator;
use econ_fabric::server::{self, AppState};
use econ_fabric::telemetry;

#[derive(Parser, Debug)]
#[command(name = "fabric")]
#[command(about = "Real-time connection and admission fabric")]
struct Args {
    /// TOML config file
    #[arg(long, env = "FABRIC_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// Worker threads (0 = host parallelism)
    #[arg(long)]
    workers: Option<usize>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_connections: Option<usize>,

    /// Number of store shards
    #[arg(long)]
    shards: Option<u32>,

    /// Disable the admission pipeline
    #[arg(long, default_value = "false")]
    no_admission: bool,

    /// Disable edge distribution
    #[arg(long, default_value = "false")]
    no_edge: bool,
}

fn load_config(args: &Args) -> Result<FabricConfig> {
    let mut config = match &args.config {
        Some(path) => FabricConfig::load(path)?,
        None => FabricConfig::default(),
    };
    config.apply_env_overrides();

    if let Some(bind) = &args.bind {
        config.bind_addr = bind.clone();
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(max) = args.max_connections {
        config.max_connections = max;
    }
    if let Some(shards) = args.shards {
        config.shard_count = shards;
    }
    if args.no_admission {
        config.enable_admission = false;
    }
    if args.no_edge {
        config.enable_edge = false;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    dotenv().ok();
    telemetry::init_tracing();

    let args = Args::parse();
    let config = load_config(&args)?;
    let workers = config.effective_workers();

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name("fabric-worker")
        .enable_all()
        .build()
        .context("Failed to build runtime")?
        .block_on(run(config, workers))
}

async fn run(config: FabricConfig, workers: usize) -> Result<()> {
    let prometheus = match telemetry::install_prometheus() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Metrics exporter unavailable: {:#}", e);
            None
        }
    };

    info!(
        bind = %config.bind_addr,
        workers,
        shards = config.shard_count,
        replication = config.replication_factor,
        "Starting fabric"
    );

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    let orchestrator = Arc::new(Orchestrator::new(config));

    let cancel = CancellationToken::new();
    let tasks = orchestrator.start(&cancel);

    let shutdown = cancel.clone();
    let registry = orchestrator.registry().clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        shutdown.cancel();
        let closed = registry.close_all("shutdown");
        info!(sessions_closed = closed, "Sessions closed");
    });

    let state = AppState::new(orchestrator.clone(), prometheus);
    server::serve(listener, state, cancel.clone())
        .await
        .context("Server error")?;

    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    info!("Fabric stopped");
    Ok(())
}
