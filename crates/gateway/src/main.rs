//! SkinScan - Main Entry Point
//!
//! Loads the settings, builds the inference pipeline and serves clients until
//! interrupted.

use anyhow::Context;
use skinscan_common::Settings;
use skinscan_gateway::Gateway;
use skinscan_worker::{EngineRegistry, Service};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "skinscan=info,skinscan_gateway=info,skinscan_worker=info,skinscan_common=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting SkinScan");

    // Load configuration
    let config_path = Settings::config_path();
    let settings = Settings::from_file(&config_path)
        .with_context(|| format!("loading settings from {}", config_path.display()))?;

    info!(
        "Settings loaded: url={}, backend={}, max_batches={}",
        settings.service.url,
        settings.tensor.backend.kind(),
        settings.tensor.max_batches
    );

    // Engine load and latency measurement block, keep them off the runtime
    let service = tokio::task::spawn_blocking(move || {
        Service::build(&settings, &EngineRegistry::with_builtin()).map(|service| (service, settings))
    })
    .await??;
    let (service, settings) = service;
    let service = Arc::new(service);
    service.start()?;

    let gateway = Gateway::new(Arc::clone(&service))?;
    let listener = TcpListener::bind(settings.service.address())
        .await
        .with_context(|| format!("binding {}", settings.service.address()))?;

    info!("SkinScan running");

    // Returns once queued requests are drained and their outcomes written
    gateway
        .serve(listener, async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Received shutdown signal");
        })
        .await?;

    info!("SkinScan shutdown complete");
    Ok(())
}
