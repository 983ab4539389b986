//! `otlp-relay` entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`config::Config`] from environment variables.
//! 2. Initialise structured JSON logging.
//! 3. Start the collector connection.
//! 4. Serve producers until Ctrl-C, then shut the connection down with a grace
//!    period for in-flight exports.

mod config;
mod relay;
mod telemetry;

use anyhow::{Context, Result};
use otlp_exporter::{ConnectionConfig, ConnectionManager, ExportClient};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = config::Config::from_env().map_err(|e| {
        eprintln!("ERROR: otlp-relay configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init(&cfg.log_level)?;

    // -----------------------------------------------------------------------
    // 3. Collector connection
    // -----------------------------------------------------------------------
    let manager = ConnectionManager::new(ConnectionConfig::new(cfg.connection_options()?));
    manager
        .start()
        .await
        .context("failed to start collector connection")?;

    // -----------------------------------------------------------------------
    // 4. Relay
    // -----------------------------------------------------------------------
    let listener = TcpListener::bind(cfg.listen_addr()?)
        .await
        .with_context(|| format!("failed to bind {}", cfg.relay_listen_addr))?;
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(relay::run(
        listener,
        ExportClient::new(manager.clone()),
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!(grace_secs = cfg.shutdown_grace_secs, "shutting down");

    shutdown.cancel();
    manager.shutdown(cfg.shutdown_grace()).await?;
    match server.await {
        Ok(result) => result?,
        Err(e) => error!(error = %e, "relay task ended abnormally"),
    }
    Ok(())
}
