//! Types exchanged between the producer, the exporter, and the collector.
//!
//! Nothing in here knows about a concrete RPC stack: status codes are the
//! gRPC canonical codes, but they are modelled as a plain enum so that the
//! retry policy and the error taxonomy can be shared by every crate.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Signals and batches
// ---------------------------------------------------------------------------

/// Kind of telemetry carried by a [`Batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    /// Span batches, sent to the collector's trace service.
    Traces,
    /// Metric batches, sent to the collector's metrics service.
    Metrics,
}

impl Signal {
    /// Fully-qualified collector service name for this signal.
    pub fn service_name(self) -> &'static str {
        match self {
            Signal::Traces => "opentelemetry.proto.collector.trace.v1.TraceService",
            Signal::Metrics => "opentelemetry.proto.collector.metrics.v1.MetricsService",
        }
    }

    /// Unary RPC path used to export a batch of this signal.
    pub fn export_path(self) -> &'static str {
        match self {
            Signal::Traces => "/opentelemetry.proto.collector.trace.v1.TraceService/Export",
            Signal::Metrics => "/opentelemetry.proto.collector.metrics.v1.MetricsService/Export",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Traces => f.write_str("traces"),
            Signal::Metrics => f.write_str("metrics"),
        }
    }
}

/// One already-encoded group of span or metric records.
///
/// The payload is opaque to this workspace: encoding is the producer's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Which collector service the batch is destined for.
    pub signal: Signal,
    /// Encoded request body.
    pub payload: Bytes,
}

impl Batch {
    /// Construct a batch from a signal and its encoded payload.
    pub fn new(signal: Signal, payload: impl Into<Bytes>) -> Self {
        Self {
            signal,
            payload: payload.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

/// gRPC canonical status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

const ALL_CODES: [StatusCode; 17] = [
    StatusCode::Ok,
    StatusCode::Cancelled,
    StatusCode::Unknown,
    StatusCode::InvalidArgument,
    StatusCode::DeadlineExceeded,
    StatusCode::NotFound,
    StatusCode::AlreadyExists,
    StatusCode::PermissionDenied,
    StatusCode::ResourceExhausted,
    StatusCode::FailedPrecondition,
    StatusCode::Aborted,
    StatusCode::OutOfRange,
    StatusCode::Unimplemented,
    StatusCode::Internal,
    StatusCode::Unavailable,
    StatusCode::DataLoss,
    StatusCode::Unauthenticated,
];

impl StatusCode {
    /// Canonical upper-case name, e.g. `"UNAVAILABLE"`.
    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Aborted => "ABORTED",
            StatusCode::OutOfRange => "OUT_OF_RANGE",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::DataLoss => "DATA_LOSS",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
        }
    }

    /// Parse a canonical name. Matching is case-insensitive.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        ALL_CODES
            .into_iter()
            .find(|code| code.as_str().eq_ignore_ascii_case(name))
    }

    /// Map a numeric wire value (0–16) to a code.
    pub fn from_i32(value: i32) -> Option<Self> {
        usize::try_from(value)
            .ok()
            .and_then(|idx| ALL_CODES.get(idx).copied())
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status returned by a single failed RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcStatus {
    pub code: StatusCode,
    pub message: String,
}

impl RpcStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

// ---------------------------------------------------------------------------
// Relay acknowledgement
// ---------------------------------------------------------------------------

/// Per-batch acknowledgement written back by the local relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayAck {
    /// `true` when the collector accepted the batch.
    pub ok: bool,
    /// Final status code when the batch failed at the RPC level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<StatusCode>,
    /// Human-readable failure description; empty on success.
    #[serde(default)]
    pub message: String,
}

impl RelayAck {
    /// Acknowledgement for a delivered batch.
    pub fn accepted() -> Self {
        Self {
            ok: true,
            code: None,
            message: String::new(),
        }
    }

    /// Acknowledgement for a rejected or undeliverable batch.
    pub fn rejected(code: Option<StatusCode>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            code,
            message: message.into(),
        }
    }
}
