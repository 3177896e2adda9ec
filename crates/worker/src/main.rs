//! Shardline Worker - Main Entry Point
//!
//! Loads the process configuration and serves the worker gRPC service until
//! Ctrl-C. Group membership, model and cache are set up by the coordinator
//! through the service.

use anyhow::Context;
use shardline_common::{WorkerServiceConfig, METRICS};
use shardline_worker::WorkerServer;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = PathBuf::from(
        std::env::var("SHARDLINE_CONFIG").unwrap_or_else(|_| "configs/worker.yaml".to_string()),
    );
    let config = WorkerServiceConfig::load(Some(&config_path))
        .with_context(|| format!("loading {}", config_path.display()))?;

    // Initialize logging
    let fallback = format!("shardline_worker={}", config.observability.log_level);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Shardline Worker");
    info!(
        "Worker configuration loaded: bind={}:{}, device={:?}, join timeout={}s",
        config.bind_address, config.port, config.device, config.join_timeout_secs
    );

    let enable_metrics = config.observability.enable_metrics;
    let server = WorkerServer::new(config);

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Received shutdown signal");
    };
    server.serve_with_shutdown(shutdown).await?;

    if enable_metrics {
        info!("Final metrics:\n{}", METRICS.gather());
    }
    info!("Shardline Worker shutdown complete");
    Ok(())
}
