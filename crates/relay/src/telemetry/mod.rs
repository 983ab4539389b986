//! Relay logging.
//!
//! One JSON object per line on stdout. The interesting events come from the
//! exporter library rather than the relay itself: connection state changes
//! and dial failures (`otlp_exporter::connection`), retry decisions
//! (`otlp_exporter::retry`) and per-batch outcomes carrying an `export_id`
//! (`otlp_exporter::client`). The relay does not export its own telemetry to
//! the collector it forwards to.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Install the global JSON subscriber.
///
/// `log_level` comes from `LOG_LEVEL` and accepts full filter directives, e.g.
/// `info,otlp_exporter::retry=debug` to trace backoff decisions. `RUST_LOG`,
/// when set, replaces it.
///
/// # Errors
///
/// Returns an error if `log_level` is not a valid directive or a global
/// subscriber is already installed.
pub fn init(log_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .map_err(|e| anyhow::anyhow!("invalid LOG_LEVEL {log_level:?}: {e}"))?,
    };

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install relay log subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::EnvFilter;

    #[test]
    fn log_level_accepts_per_module_directives() {
        assert!(EnvFilter::try_new("info,otlp_exporter::retry=debug").is_ok());
        assert!(EnvFilter::try_new("info,otlp_exporter=loud").is_err());
    }
}
