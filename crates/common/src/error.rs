//! Error taxonomy shared by the exporter library and the relay.

use thiserror::Error;

use crate::protocol::{RpcStatus, StatusCode};

/// Invalid connection configuration, detected when the connection is started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Neither insecure transport nor TLS credentials were configured.
    #[error("transport security is required: configure TLS credentials or allow insecure transport")]
    MissingSecurity,

    /// Both insecure transport and TLS credentials were configured.
    #[error("ambiguous transport security: both insecure transport and TLS credentials are set")]
    AmbiguousSecurity,

    /// The collector address is empty or cannot form an endpoint URI.
    #[error("invalid collector address: {0}")]
    InvalidAddress(String),

    /// The compressor name is not in the codec table.
    #[error("unknown compressor: {0}")]
    UnknownCompressor(String),

    /// A header name or value cannot be sent as request metadata.
    #[error("invalid header {name:?}: {reason}")]
    InvalidHeader { name: String, reason: String },

    /// The reconnection period is zero.
    #[error("reconnection period must be greater than zero")]
    InvalidPeriod,
}

/// Failure of a single export, as seen by the producer.
///
/// Only [`ExportError::Terminal`], [`ExportError::Disconnected`],
/// [`ExportError::Dial`] and [`ExportError::Shutdown`] normally reach the
/// producer; [`ExportError::Transient`] is consumed by the retry loop.
#[derive(Debug, Clone, Error)]
pub enum ExportError {
    /// Configuration rejected by `start()`. Never retried.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No connection to the collector has ever been established.
    #[error("failed to connect to collector: {0}")]
    Dial(String),

    /// The connection is down and the exporter is configured to fail fast.
    #[error("not connected to collector")]
    Disconnected,

    /// One attempt failed; the retry policy decides what happens next.
    #[error("export attempt failed: {0}")]
    Transient(RpcStatus),

    /// The batch failed for good: non-retryable status or retries exhausted.
    #[error("export failed after {attempts} attempt(s): {status}")]
    Terminal { status: RpcStatus, attempts: u32 },

    /// The exporter has been shut down.
    #[error("exporter is shut down")]
    Shutdown,
}

impl ExportError {
    /// Status code carried by RPC-level failures.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            ExportError::Transient(status) | ExportError::Terminal { status, .. } => {
                Some(status.code)
            }
            _ => None,
        }
    }
}
