//! Configuration loading and validation for the relay.
//!
//! All values come from environment variables. Collector settings are turned
//! into exporter [`ConnectionOption`]s; the exporter itself decides whether the
//! resulting connection configuration is usable when the manager starts.

use std::{collections::HashMap, net::SocketAddr, time::Duration};

use anyhow::{Context, Result};
use otlp_exporter::{config::DEFAULT_COLLECTOR_PORT, ConnectionOption, DisconnectedExports};
use serde::Deserialize;
use tonic::transport::{Certificate, ClientTlsConfig};

/// Validated relay configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Collector `host:port`.
    #[serde(default = "default_collector_address")]
    pub collector_address: String,

    /// Dial the collector without TLS.
    #[serde(default)]
    pub insecure: bool,

    /// PEM bundle of CA certificates trusted for the collector. Enables TLS.
    #[serde(default)]
    pub tls_ca_path: Option<String>,

    /// Server name to verify instead of the address host.
    #[serde(default)]
    pub tls_domain: Option<String>,

    /// Compression codec name (e.g. `gzip`).
    #[serde(default)]
    pub compressor: Option<String>,

    /// Headers sent with every export, as `key=value,key=value`.
    #[serde(default)]
    pub headers: Option<String>,

    #[serde(default = "default_reconnection_period")]
    pub reconnection_period_secs: u64,

    /// Deadline for one batch, retries included.
    #[serde(default = "default_export_timeout")]
    pub export_timeout_secs: u64,

    /// gRPC service config JSON overriding the built-in retry policy.
    #[serde(default)]
    pub service_config: Option<String>,

    /// Hold exports while reconnecting instead of failing them.
    #[serde(default)]
    pub wait_for_reconnect: bool,

    /// How long in-flight exports may run after shutdown starts.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Local TCP address producers send framed batches to.
    #[serde(default = "default_listen_addr")]
    pub relay_listen_addr: String,

    /// Tracing log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_collector_address() -> String {
    format!("localhost:{DEFAULT_COLLECTOR_PORT}")
}
fn default_reconnection_period() -> u64 {
    10
}
fn default_export_timeout() -> u64 {
    10
}
fn default_shutdown_grace() -> u64 {
    5
}
fn default_listen_addr() -> String {
    "127.0.0.1:4320".into()
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or fails validation.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build relay configuration")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise relay configuration")?;

        c.validate()?;
        Ok(c)
    }

    fn validate(&self) -> Result<()> {
        if self.collector_address.trim().is_empty() {
            anyhow::bail!("COLLECTOR_ADDRESS must not be empty");
        }
        if self.reconnection_period_secs == 0 {
            anyhow::bail!("RECONNECTION_PERIOD_SECS must be > 0");
        }
        if self.export_timeout_secs == 0 {
            anyhow::bail!("EXPORT_TIMEOUT_SECS must be > 0");
        }
        self.listen_addr()?;
        if let Some(headers) = &self.headers {
            parse_headers(headers)?;
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.relay_listen_addr
            .parse()
            .with_context(|| format!("RELAY_LISTEN_ADDR {:?} is not a socket address", self.relay_listen_addr))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Exporter options in application order.
    ///
    /// # Errors
    ///
    /// Returns an error if the CA bundle cannot be read or the header list is
    /// malformed.
    pub fn connection_options(&self) -> Result<Vec<ConnectionOption>> {
        let mut options = vec![
            ConnectionOption::Address(self.collector_address.trim().to_string()),
            ConnectionOption::ReconnectionPeriod(Duration::from_secs(self.reconnection_period_secs)),
            ConnectionOption::ExportTimeout(Duration::from_secs(self.export_timeout_secs)),
        ];
        if self.insecure {
            options.push(ConnectionOption::Insecure);
        }
        if let Some(path) = &self.tls_ca_path {
            let pem = std::fs::read(path)
                .with_context(|| format!("failed to read TLS_CA_PATH {path}"))?;
            let mut tls = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem));
            if let Some(domain) = &self.tls_domain {
                tls = tls.domain_name(domain.clone());
            }
            options.push(ConnectionOption::TlsCredentials(tls));
        }
        if let Some(name) = &self.compressor {
            options.push(ConnectionOption::Compressor(name.clone()));
        }
        if let Some(headers) = &self.headers {
            options.push(ConnectionOption::Headers(parse_headers(headers)?));
        }
        if let Some(doc) = &self.service_config {
            options.push(ConnectionOption::ServiceConfig(doc.clone()));
        }
        if self.wait_for_reconnect {
            options.push(ConnectionOption::DisconnectedExports(
                DisconnectedExports::WaitForReconnect,
            ));
        }
        Ok(options)
    }
}

/// Parse `key=value,key=value`. Blank entries are ignored.
fn parse_headers(raw: &str) -> Result<HashMap<String, String>> {
    let mut headers = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((key, value)) = entry.split_once('=') else {
            anyhow::bail!("HEADERS entry {entry:?} is not key=value");
        };
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("HEADERS entry {entry:?} has an empty key");
        }
        headers.insert(key.to_string(), value.trim().to_string());
    }
    Ok(headers)
}
