//! Seam between connection management and the wire.
//!
//! A [`Dialer`] opens connections; each one is a [`Transport`] that can carry
//! any number of concurrent export calls. The production implementation is
//! [`grpc::GrpcDialer`]; tests plug in scripted fakes.

pub mod grpc;

#[cfg(test)]
pub(crate) mod fake;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use common::{RpcStatus, Signal};
use thiserror::Error;
use tonic::metadata::MetadataMap;

use crate::config::{Compression, DialTarget};

/// A dial attempt that did not produce a connection.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct DialError(pub String);

/// Failure of one call on an established transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The collector (or the RPC layer) answered with a status.
    #[error("{0}")]
    Rpc(RpcStatus),

    /// The connection itself failed; it should be replaced.
    #[error("connection failure: {0}")]
    Broken(String),
}

/// One unary export request.
#[derive(Debug, Clone)]
pub struct ExportCall {
    pub signal: Signal,
    pub payload: Bytes,
    /// Headers sent with the call.
    pub metadata: MetadataMap,
    pub compression: Option<Compression>,
    /// Time left before the export deadline.
    pub timeout: Duration,
}

/// An established connection to the collector.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one batch as a single RPC.
    async fn export(&self, call: ExportCall) -> Result<(), TransportError>;

    /// Resolves once the transport knows the connection is gone
    /// (e.g. keepalive loss). Transports that cannot tell never resolve.
    async fn closed(&self) {
        std::future::pending::<()>().await
    }

    /// Release the connection. Called once, after in-flight calls drained
    /// or the grace period ran out.
    async fn close(&self);
}

/// Opens new connections to the collector.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Dial and complete the handshake.
    ///
    /// # Errors
    ///
    /// Returns a [`DialError`] if no connection could be established.
    async fn dial(&self, target: &DialTarget) -> Result<Box<dyn Transport>, DialError>;
}
