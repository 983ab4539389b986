//! Common types, protocol definitions, and errors shared across `otlp-conduit` crates.

pub mod error;
pub mod protocol;

pub use error::{ConfigError, ExportError};
pub use protocol::{Batch, RelayAck, RpcStatus, Signal, StatusCode};
