//! Transport layer of an OTLP/gRPC telemetry exporter.
//!
//! A [`ConnectionManager`] owns the single connection to the collector and
//! keeps it alive with a fixed-period reconnect loop. An [`ExportClient`]
//! sends already-encoded trace and metric batches over that connection, one
//! RPC per attempt, retrying per the [`RetryPolicy`] derived from a gRPC
//! service-config document.
//!
//! ```no_run
//! # async fn demo() -> Result<(), otlp_exporter::ExportError> {
//! use std::time::Duration;
//! use otlp_exporter::{Batch, ConnectionConfig, ConnectionManager, ExportClient, Signal};
//!
//! let manager = ConnectionManager::new(
//!     ConnectionConfig::default()
//!         .with_insecure()
//!         .with_address("localhost:4317"),
//! );
//! manager.start().await?;
//!
//! let client = ExportClient::new(manager.clone());
//! client.export(Batch::new(Signal::Traces, Vec::<u8>::new())).await?;
//!
//! manager.shutdown(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod retry;
pub mod transport;

pub use client::ExportClient;
pub use common::{Batch, ConfigError, ExportError, RpcStatus, Signal, StatusCode};
pub use config::{
    Compression, ConnectionConfig, ConnectionOption, DisconnectedExports, DEFAULT_SERVICE_CONFIG,
};
pub use connection::{ConnectionManager, ConnectionState, StateReceiver};
pub use retry::RetryPolicy;
