//! Connection configuration assembled from ordered, independent options.
//!
//! A [`ConnectionConfig`] is built by applying [`ConnectionOption`]s (or the
//! equivalent `with_*` builder methods) in caller order. Every option sets
//! exactly one field and later options win. Nothing is validated while
//! configuring: [`ConnectionConfig::resolve`] runs when the connection is
//! started and turns the raw settings into a [`ResolvedConfig`].

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use common::{ConfigError, Signal};
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap};
use tonic::transport::{ClientTlsConfig, Endpoint, Uri};

use crate::retry::RetryPolicy;

/// Collector host used when no address is configured.
pub const DEFAULT_COLLECTOR_HOST: &str = "localhost";

/// Collector port used when no address is configured.
pub const DEFAULT_COLLECTOR_PORT: u16 = 55680;

/// Wait between dial attempts after a connection failure.
pub const DEFAULT_RECONNECTION_PERIOD: Duration = Duration::from_secs(10);

/// Bound on a single dial attempt.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Overall deadline for one batch when the producer supplies none.
pub const DEFAULT_EXPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a superseded handle stays open for in-flight exports.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Service config applied when none is provided.
///
/// `MaxAttempts` above 5 is treated as 5 (gRPC A6 retry design).
pub const DEFAULT_SERVICE_CONFIG: &str = r#"{
    "methodConfig": [{
        "name": [
            { "service": "opentelemetry.proto.collector.metrics.v1.MetricsService" },
            { "service": "opentelemetry.proto.collector.trace.v1.TraceService" }
        ],
        "retryPolicy": {
            "MaxAttempts": 5,
            "InitialBackoff": "0.3s",
            "MaxBackoff": "5s",
            "BackoffMultiplier": 2,
            "RetryableStatusCodes": [
                "UNAVAILABLE",
                "CANCELLED",
                "DEADLINE_EXCEEDED",
                "RESOURCE_EXHAUSTED",
                "ABORTED",
                "OUT_OF_RANGE",
                "UNAVAILABLE",
                "DATA_LOSS"
            ]
        }
    }]
}"#;

/// Low-level endpoint mutator applied after every computed setting.
pub type EndpointOption = Arc<dyn Fn(Endpoint) -> Endpoint + Send + Sync>;

/// What an export does when the connection is not currently up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectedExports {
    /// Return [`common::ExportError::Disconnected`] immediately.
    #[default]
    FailFast,
    /// Wait for the next successful connection, up to the export deadline.
    WaitForReconnect,
}

/// Compression codecs that can be requested per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
}

impl Compression {
    /// Resolve a compressor name against the codec table.
    ///
    /// An empty name or `"none"` means no compression.
    pub fn from_name(name: &str) -> Result<Option<Self>, ConfigError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "identity" => Ok(None),
            "gzip" => Ok(Some(Compression::Gzip)),
            _ => Err(ConfigError::UnknownCompressor(name.to_owned())),
        }
    }
}

/// One configuration mutator.
#[derive(Clone)]
pub enum ConnectionOption {
    /// Disable the transport security requirement.
    Insecure,
    /// Collector `host:port`.
    Address(String),
    /// Fixed interval between dial attempts after a failure.
    ReconnectionPeriod(Duration),
    /// Compression codec requested on every call.
    Compressor(String),
    /// Replace the header map sent with every call.
    Headers(HashMap<String, String>),
    /// TLS configuration for secure dialing.
    TlsCredentials(ClientTlsConfig),
    /// Replace the retry-policy service config document.
    ServiceConfig(String),
    /// Append endpoint mutators; they run after all computed settings.
    EndpointOptions(Vec<EndpointOption>),
    DialTimeout(Duration),
    ExportTimeout(Duration),
    DrainTimeout(Duration),
    DisconnectedExports(DisconnectedExports),
}

impl fmt::Debug for ConnectionOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionOption::Insecure => f.write_str("Insecure"),
            ConnectionOption::Address(a) => f.debug_tuple("Address").field(a).finish(),
            ConnectionOption::ReconnectionPeriod(d) => {
                f.debug_tuple("ReconnectionPeriod").field(d).finish()
            }
            ConnectionOption::Compressor(c) => f.debug_tuple("Compressor").field(c).finish(),
            ConnectionOption::Headers(h) => {
                // Header values may carry API keys.
                f.debug_tuple("Headers").field(&h.keys().collect::<Vec<_>>()).finish()
            }
            ConnectionOption::TlsCredentials(_) => f.write_str("TlsCredentials(..)"),
            ConnectionOption::ServiceConfig(_) => f.write_str("ServiceConfig(..)"),
            ConnectionOption::EndpointOptions(o) => {
                f.debug_tuple("EndpointOptions").field(&o.len()).finish()
            }
            ConnectionOption::DialTimeout(d) => f.debug_tuple("DialTimeout").field(d).finish(),
            ConnectionOption::ExportTimeout(d) => f.debug_tuple("ExportTimeout").field(d).finish(),
            ConnectionOption::DrainTimeout(d) => f.debug_tuple("DrainTimeout").field(d).finish(),
            ConnectionOption::DisconnectedExports(p) => {
                f.debug_tuple("DisconnectedExports").field(p).finish()
            }
        }
    }
}

/// Raw connection parameters. Validated only by [`ConnectionConfig::resolve`].
#[derive(Clone)]
pub struct ConnectionConfig {
    allow_insecure: bool,
    collector_address: String,
    compressor: Option<String>,
    reconnection_period: Duration,
    service_config: String,
    endpoint_options: Vec<EndpointOption>,
    headers: HashMap<String, String>,
    credentials: Option<ClientTlsConfig>,
    dial_timeout: Duration,
    export_timeout: Duration,
    drain_timeout: Duration,
    disconnected_exports: DisconnectedExports,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            allow_insecure: false,
            collector_address: format!("{DEFAULT_COLLECTOR_HOST}:{DEFAULT_COLLECTOR_PORT}"),
            compressor: None,
            reconnection_period: DEFAULT_RECONNECTION_PERIOD,
            service_config: DEFAULT_SERVICE_CONFIG.to_owned(),
            endpoint_options: Vec::new(),
            headers: HashMap::new(),
            credentials: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            export_timeout: DEFAULT_EXPORT_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            disconnected_exports: DisconnectedExports::default(),
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("allow_insecure", &self.allow_insecure)
            .field("collector_address", &self.collector_address)
            .field("compressor", &self.compressor)
            .field("reconnection_period", &self.reconnection_period)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("has_credentials", &self.credentials.is_some())
            .field("endpoint_options", &self.endpoint_options.len())
            .field("dial_timeout", &self.dial_timeout)
            .field("export_timeout", &self.export_timeout)
            .field("drain_timeout", &self.drain_timeout)
            .field("disconnected_exports", &self.disconnected_exports)
            .finish_non_exhaustive()
    }
}

impl ConnectionConfig {
    /// Build a configuration by applying `options` in order over the defaults.
    pub fn new(options: impl IntoIterator<Item = ConnectionOption>) -> Self {
        let mut cfg = Self::default();
        for option in options {
            cfg.apply(option);
        }
        cfg
    }

    /// Apply a single option. Sets exactly one field.
    pub fn apply(&mut self, option: ConnectionOption) {
        match option {
            ConnectionOption::Insecure => self.allow_insecure = true,
            ConnectionOption::Address(addr) => self.collector_address = addr,
            ConnectionOption::ReconnectionPeriod(p) => self.reconnection_period = p,
            ConnectionOption::Compressor(name) => self.compressor = Some(name),
            ConnectionOption::Headers(h) => self.headers = h,
            ConnectionOption::TlsCredentials(tls) => self.credentials = Some(tls),
            ConnectionOption::ServiceConfig(doc) => self.service_config = doc,
            ConnectionOption::EndpointOptions(opts) => self.endpoint_options.extend(opts),
            ConnectionOption::DialTimeout(d) => self.dial_timeout = d,
            ConnectionOption::ExportTimeout(d) => self.export_timeout = d,
            ConnectionOption::DrainTimeout(d) => self.drain_timeout = d,
            ConnectionOption::DisconnectedExports(p) => self.disconnected_exports = p,
        }
    }

    fn with(mut self, option: ConnectionOption) -> Self {
        self.apply(option);
        self
    }

    pub fn with_insecure(self) -> Self {
        self.with(ConnectionOption::Insecure)
    }

    pub fn with_address(self, addr: impl Into<String>) -> Self {
        self.with(ConnectionOption::Address(addr.into()))
    }

    pub fn with_reconnection_period(self, period: Duration) -> Self {
        self.with(ConnectionOption::ReconnectionPeriod(period))
    }

    pub fn with_compressor(self, name: impl Into<String>) -> Self {
        self.with(ConnectionOption::Compressor(name.into()))
    }

    pub fn with_headers(self, headers: HashMap<String, String>) -> Self {
        self.with(ConnectionOption::Headers(headers))
    }

    pub fn with_tls_credentials(self, tls: ClientTlsConfig) -> Self {
        self.with(ConnectionOption::TlsCredentials(tls))
    }

    pub fn with_service_config(self, doc: impl Into<String>) -> Self {
        self.with(ConnectionOption::ServiceConfig(doc.into()))
    }

    /// Append one endpoint mutator. It runs after every computed setting, so
    /// it wins over anything derived from the rest of this config.
    pub fn with_endpoint_option<F>(self, option: F) -> Self
    where
        F: Fn(Endpoint) -> Endpoint + Send + Sync + 'static,
    {
        self.with(ConnectionOption::EndpointOptions(vec![Arc::new(option)]))
    }

    pub fn with_dial_timeout(self, timeout: Duration) -> Self {
        self.with(ConnectionOption::DialTimeout(timeout))
    }

    pub fn with_export_timeout(self, timeout: Duration) -> Self {
        self.with(ConnectionOption::ExportTimeout(timeout))
    }

    pub fn with_drain_timeout(self, timeout: Duration) -> Self {
        self.with(ConnectionOption::DrainTimeout(timeout))
    }

    pub fn with_disconnected_exports(self, policy: DisconnectedExports) -> Self {
        self.with(ConnectionOption::DisconnectedExports(policy))
    }

    pub fn collector_address(&self) -> &str {
        &self.collector_address
    }

    pub fn reconnection_period(&self) -> Duration {
        self.reconnection_period
    }

    /// Validate the configuration and derive everything the connection needs.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for missing or ambiguous transport security,
    /// an unusable address, an unknown compressor, a header that cannot be
    /// sent as metadata, or a zero reconnection period.
    pub fn resolve(&self) -> Result<ResolvedConfig, ConfigError> {
        match (self.allow_insecure, self.credentials.is_some()) {
            (false, false) => return Err(ConfigError::MissingSecurity),
            (true, true) => return Err(ConfigError::AmbiguousSecurity),
            _ => {}
        }

        let address = self.collector_address.trim();
        if address.is_empty() {
            return Err(ConfigError::InvalidAddress("address is empty".into()));
        }
        if address.contains("://") {
            return Err(ConfigError::InvalidAddress(format!(
                "{address}: expected host:port without a scheme"
            )));
        }
        format!("http://{address}")
            .parse::<Uri>()
            .map_err(|e| ConfigError::InvalidAddress(format!("{address}: {e}")))?;

        if self.reconnection_period.is_zero() {
            return Err(ConfigError::InvalidPeriod);
        }

        let compression = match &self.compressor {
            Some(name) => Compression::from_name(name)?,
            None => None,
        };

        let metadata = headers_to_metadata(&self.headers)?;

        let calls = CallSettings {
            metadata,
            compression,
            traces_policy: RetryPolicy::from_service_config(
                &self.service_config,
                Signal::Traces.service_name(),
            ),
            metrics_policy: RetryPolicy::from_service_config(
                &self.service_config,
                Signal::Metrics.service_name(),
            ),
        };

        Ok(ResolvedConfig {
            dial: DialTarget {
                address: address.to_owned(),
                credentials: self.credentials.clone(),
                endpoint_options: self.endpoint_options.clone(),
                dial_timeout: self.dial_timeout,
            },
            calls: Arc::new(calls),
            reconnection_period: self.reconnection_period,
            export_timeout: self.export_timeout,
            drain_timeout: self.drain_timeout,
            disconnected_exports: self.disconnected_exports,
        })
    }
}

fn headers_to_metadata(headers: &HashMap<String, String>) -> Result<MetadataMap, ConfigError> {
    let mut metadata = MetadataMap::with_capacity(headers.len());
    for (name, value) in headers {
        let key = AsciiMetadataKey::from_bytes(name.as_bytes()).map_err(|e| {
            ConfigError::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            }
        })?;
        let value = AsciiMetadataValue::try_from(value.as_str()).map_err(|e| {
            ConfigError::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            }
        })?;
        metadata.insert(key, value);
    }
    Ok(metadata)
}

/// Everything the dialer needs to open a connection.
#[derive(Clone)]
pub struct DialTarget {
    /// Collector `host:port`.
    pub address: String,
    /// TLS configuration; `None` means plaintext.
    pub credentials: Option<ClientTlsConfig>,
    /// Mutators applied last to the endpoint.
    pub endpoint_options: Vec<EndpointOption>,
    pub dial_timeout: Duration,
}

impl fmt::Debug for DialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialTarget")
            .field("address", &self.address)
            .field("tls", &self.credentials.is_some())
            .field("endpoint_options", &self.endpoint_options.len())
            .field("dial_timeout", &self.dial_timeout)
            .finish()
    }
}

/// Per-call settings shared by every export.
#[derive(Debug, Clone)]
pub struct CallSettings {
    /// Headers converted to request metadata.
    pub metadata: MetadataMap,
    pub compression: Option<Compression>,
    traces_policy: RetryPolicy,
    metrics_policy: RetryPolicy,
}

impl CallSettings {
    /// Retry policy derived for the collector service handling `signal`.
    pub fn policy(&self, signal: Signal) -> &RetryPolicy {
        match signal {
            Signal::Traces => &self.traces_policy,
            Signal::Metrics => &self.metrics_policy,
        }
    }
}

/// Validated configuration owned by a running connection manager.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub dial: DialTarget,
    pub calls: Arc<CallSettings>,
    pub reconnection_period: Duration,
    pub export_timeout: Duration,
    pub drain_timeout: Duration,
    pub disconnected_exports: DisconnectedExports,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ConnectionConfig::default();
        assert_eq!(cfg.collector_address(), "localhost:55680");
        assert_eq!(cfg.reconnection_period(), Duration::from_secs(10));
        assert_eq!(cfg.disconnected_exports, DisconnectedExports::FailFast);
        assert_eq!(cfg.service_config, DEFAULT_SERVICE_CONFIG);
    }

    #[test]
    fn later_options_win() {
        let cfg = ConnectionConfig::new([
            ConnectionOption::Address("first:1".into()),
            ConnectionOption::ReconnectionPeriod(Duration::from_secs(1)),
            ConnectionOption::Address("second:2".into()),
            ConnectionOption::ReconnectionPeriod(Duration::from_secs(2)),
        ]);
        assert_eq!(cfg.collector_address(), "second:2");
        assert_eq!(cfg.reconnection_period(), Duration::from_secs(2));
    }

    #[test]
    fn headers_are_replaced_not_merged() {
        let cfg = ConnectionConfig::default()
            .with_headers(HashMap::from([("a".to_owned(), "1".to_owned())]))
            .with_headers(HashMap::from([("b".to_owned(), "2".to_owned())]));
        assert!(!cfg.headers.contains_key("a"));
        assert_eq!(cfg.headers.get("b").map(String::as_str), Some("2"));
    }

    #[test]
    fn endpoint_options_are_appended() {
        let cfg = ConnectionConfig::default()
            .with_endpoint_option(|e| e.tcp_nodelay(true))
            .with_endpoint_option(|e| e.concurrency_limit(8));
        assert_eq!(cfg.endpoint_options.len(), 2);
    }

    #[test]
    fn configuring_does_not_validate() {
        // An unusable compressor is only reported by resolve().
        let cfg = ConnectionConfig::default().with_compressor("brotli");
        assert_eq!(cfg.compressor.as_deref(), Some("brotli"));
    }

    #[test]
    fn resolve_requires_security() {
        let err = ConnectionConfig::default().resolve().unwrap_err();
        assert_eq!(err, ConfigError::MissingSecurity);
    }

    #[test]
    fn resolve_rejects_ambiguous_security() {
        let err = ConnectionConfig::default()
            .with_insecure()
            .with_tls_credentials(ClientTlsConfig::new())
            .resolve()
            .unwrap_err();
        assert_eq!(err, ConfigError::AmbiguousSecurity);
    }

    #[test]
    fn resolve_accepts_tls_only() {
        let resolved = ConnectionConfig::default()
            .with_tls_credentials(ClientTlsConfig::new().domain_name("collector.internal"))
            .resolve()
            .unwrap();
        assert!(resolved.dial.credentials.is_some());
    }

    #[test]
    fn resolve_rejects_unknown_compressor() {
        let err = ConnectionConfig::default()
            .with_insecure()
            .with_compressor("brotli")
            .resolve()
            .unwrap_err();
        assert_eq!(err, ConfigError::UnknownCompressor("brotli".into()));
    }

    #[test]
    fn resolve_maps_gzip() {
        let resolved = ConnectionConfig::default()
            .with_insecure()
            .with_compressor("GZIP")
            .resolve()
            .unwrap();
        assert_eq!(resolved.calls.compression, Some(Compression::Gzip));
    }

    #[test]
    fn resolve_rejects_bad_header() {
        let err = ConnectionConfig::default()
            .with_insecure()
            .with_headers(HashMap::from([("bad header".to_owned(), "v".to_owned())]))
            .resolve()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidHeader { .. }));
    }

    #[test]
    fn resolve_converts_headers_to_metadata() {
        let resolved = ConnectionConfig::default()
            .with_insecure()
            .with_headers(HashMap::from([("x-api-key".to_owned(), "secret".to_owned())]))
            .resolve()
            .unwrap();
        assert_eq!(
            resolved.calls.metadata.get("x-api-key").and_then(|v| v.to_str().ok()),
            Some("secret")
        );
    }

    #[test]
    fn resolve_rejects_empty_or_schemed_address() {
        let empty = ConnectionConfig::default().with_insecure().with_address("  ");
        assert!(matches!(empty.resolve(), Err(ConfigError::InvalidAddress(_))));

        let schemed = ConnectionConfig::default()
            .with_insecure()
            .with_address("http://collector:4317");
        assert!(matches!(schemed.resolve(), Err(ConfigError::InvalidAddress(_))));
    }

    #[test]
    fn resolve_rejects_zero_period() {
        let err = ConnectionConfig::default()
            .with_insecure()
            .with_reconnection_period(Duration::ZERO)
            .resolve()
            .unwrap_err();
        assert_eq!(err, ConfigError::InvalidPeriod);
    }

    #[test]
    fn malformed_service_config_falls_back_to_defaults() {
        let resolved = ConnectionConfig::default()
            .with_insecure()
            .with_service_config("{ not json")
            .resolve()
            .unwrap();
        assert_eq!(resolved.calls.policy(Signal::Traces), &RetryPolicy::default());
    }

    #[test]
    fn debug_output_hides_header_values() {
        let cfg = ConnectionConfig::default()
            .with_headers(HashMap::from([("x-api-key".to_owned(), "secret".to_owned())]));
        let text = format!("{cfg:?}");
        assert!(text.contains("x-api-key"));
        assert!(!text.contains("secret"));
    }
}
