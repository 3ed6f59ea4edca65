use anyhow::{Context, Result};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod session;

use config::DaemonConfig;
use dbus_interface::{KohService, BUS_NAME, OBJECT_PATH};
use koh_core::BusKind;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("kohd starting");

    let config = DaemonConfig::from_env();
    let threshold = config.recognizer.confidence_threshold;

    // Model loading and corpus training are blocking; keep them off the runtime.
    let recognizer_config = config.recognizer.clone();
    let handle = tokio::task::spawn_blocking(move || engine::spawn_engine(&recognizer_config))
        .await
        .context("engine startup task panicked")?
        .context("failed to start recognition engine")?;

    let service = KohService::new(
        handle,
        threshold,
        Duration::from_secs(config.request_timeout_secs),
    );

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to claim D-Bus name")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, threshold, "kohd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("kohd shutting down");

    Ok(())
}
