//! OTLP/gRPC transport on top of `tonic`.
//!
//! Payloads are already-encoded protobuf requests, so calls go through a
//! pass-through [`RawCodec`] instead of generated message types. The response
//! body is read and discarded.
//!
//! Connection loss is noticed on the next export: HTTP/2 keepalive pings fail
//! the channel, the call comes back with a transport error, and the client
//! marks the handle broken. [`GrpcTransport`] does not implement
//! [`Transport::closed`].

use std::{error::Error as StdError, time::Duration};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes};
use common::{RpcStatus, StatusCode};
use tokio::sync::RwLock;
use tonic::client::Grpc;
use tonic::codec::{Codec, CompressionEncoding, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};
use tracing::debug;

use super::{DialError, Dialer, ExportCall, Transport, TransportError};
use crate::config::{Compression, DialTarget};

/// Interval between HTTP/2 keepalive pings, idle connections included.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// How long a keepalive ping may go unanswered before the connection fails.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials the collector with an eager `tonic` channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcDialer;

#[async_trait]
impl Dialer for GrpcDialer {
    async fn dial(&self, target: &DialTarget) -> Result<Box<dyn Transport>, DialError> {
        let endpoint = endpoint_for(target)?;
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| DialError(format!("connect to {}: {}", target.address, describe(&e))))?;
        debug!(address = %target.address, tls = target.credentials.is_some(), "gRPC channel established");
        Ok(Box::new(GrpcTransport {
            channel: RwLock::new(Some(channel)),
        }))
    }
}

/// Build the endpoint: scheme from the security mode, keepalive, then TLS,
/// then the caller's endpoint options last so they override computed settings.
fn endpoint_for(target: &DialTarget) -> Result<Endpoint, DialError> {
    let scheme = if target.credentials.is_some() {
        "https"
    } else {
        "http"
    };
    let mut endpoint = Endpoint::from_shared(format!("{scheme}://{}", target.address))
        .map_err(|e| DialError(format!("invalid collector address {}: {e}", target.address)))?
        .connect_timeout(target.dial_timeout)
        .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
        .keep_alive_timeout(KEEPALIVE_TIMEOUT)
        .keep_alive_while_idle(true);

    if let Some(tls) = &target.credentials {
        endpoint = endpoint
            .tls_config(tls.clone())
            .map_err(|e| DialError(format!("invalid TLS configuration: {}", describe(&e))))?;
    }

    for option in &target.endpoint_options {
        endpoint = option(endpoint);
    }
    Ok(endpoint)
}

/// A live gRPC channel to the collector.
pub struct GrpcTransport {
    channel: RwLock<Option<Channel>>,
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn export(&self, call: ExportCall) -> Result<(), TransportError> {
        let channel = self
            .channel
            .read()
            .await
            .clone()
            .ok_or_else(|| TransportError::Broken("channel closed".into()))?;

        let mut grpc = Grpc::new(channel);
        if call.compression == Some(Compression::Gzip) {
            grpc = grpc
                .send_compressed(CompressionEncoding::Gzip)
                .accept_compressed(CompressionEncoding::Gzip);
        }
        grpc.ready()
            .await
            .map_err(|e| TransportError::Broken(describe(&e)))?;

        let mut request = Request::new(call.payload);
        *request.metadata_mut() = call.metadata;
        request.set_timeout(call.timeout);

        let path = PathAndQuery::from_static(call.signal.export_path());
        grpc.unary(request, path, RawCodec)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn close(&self) {
        // In-flight calls hold their own channel clones; dropping ours stops
        // new calls from using this connection.
        self.channel.write().await.take();
    }
}

/// Split a failed call into collector status vs connection failure.
fn classify(status: Status) -> TransportError {
    let from_transport = StdError::source(&status)
        .is_some_and(|source| source.is::<tonic::transport::Error>());
    if from_transport {
        return TransportError::Broken(format!("{}: {}", status.message(), describe(&status)));
    }
    let code = StatusCode::from_i32(i32::from(status.code())).unwrap_or(StatusCode::Unknown);
    TransportError::Rpc(RpcStatus::new(code, status.message()))
}

/// Render an error with its source chain; tonic's top-level messages are terse.
fn describe(err: &(dyn StdError + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

// ---------------------------------------------------------------------------
// Pass-through codec
// ---------------------------------------------------------------------------

/// Codec that writes the request bytes verbatim and returns the raw response.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = RawCodec;
    type Decoder = RawCodec;

    fn encoder(&mut self) -> Self::Encoder {
        RawCodec
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawCodec
    }
}

impl Encoder for RawCodec {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Bytes, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        dst.put(item);
        Ok(())
    }
}

impl Decoder for RawCodec {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Bytes>, Status> {
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};
    use tonic::transport::ClientTlsConfig;

    fn target(tls: bool) -> DialTarget {
        DialTarget {
            address: "collector.internal:4317".into(),
            credentials: tls.then(ClientTlsConfig::new),
            endpoint_options: Vec::new(),
            dial_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn insecure_target_uses_http() {
        let endpoint = endpoint_for(&target(false)).unwrap();
        assert_eq!(endpoint.uri().scheme_str(), Some("http"));
        assert_eq!(endpoint.uri().authority().map(|a| a.as_str()), Some("collector.internal:4317"));
    }

    #[test]
    fn tls_target_uses_https() {
        let endpoint = endpoint_for(&target(true)).unwrap();
        assert_eq!(endpoint.uri().scheme_str(), Some("https"));
    }

    #[test]
    fn endpoint_options_run_in_order() {
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut t = target(false);
        for label in ["first", "second"] {
            let calls = calls.clone();
            t.endpoint_options.push(Arc::new(move |e: Endpoint| {
                calls.lock().unwrap().push(label);
                e
            }));
        }
        endpoint_for(&t).unwrap();
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn collector_status_is_an_rpc_error() {
        let err = classify(Status::invalid_argument("malformed spans"));
        match err {
            TransportError::Rpc(status) => {
                assert_eq!(status.code, StatusCode::InvalidArgument);
                assert_eq!(status.message, "malformed spans");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unavailable_without_transport_source_is_still_an_rpc_error() {
        assert!(matches!(
            classify(Status::unavailable("collector overloaded")),
            TransportError::Rpc(RpcStatus {
                code: StatusCode::Unavailable,
                ..
            })
        ));
    }

    fn closed_port() -> std::net::SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    fn call() -> ExportCall {
        ExportCall {
            signal: common::Signal::Traces,
            payload: Bytes::from_static(b"spans"),
            metadata: tonic::metadata::MetadataMap::new(),
            compression: None,
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn export_over_dead_connection_is_broken() {
        let addr = closed_port();
        let channel = Endpoint::from_shared(format!("http://{addr}"))
            .unwrap()
            .connect_lazy();
        let transport = GrpcTransport {
            channel: RwLock::new(Some(channel)),
        };

        let err = transport.export(call()).await.unwrap_err();
        assert!(matches!(err, TransportError::Broken(_)), "{err:?}");
    }

    #[tokio::test]
    async fn export_after_close_is_broken() {
        let channel = Endpoint::from_static("http://127.0.0.1:1").connect_lazy();
        let transport = GrpcTransport {
            channel: RwLock::new(Some(channel)),
        };
        transport.close().await;

        let err = transport.export(call()).await.unwrap_err();
        assert!(matches!(err, TransportError::Broken(reason) if reason == "channel closed"));
    }

    #[tokio::test]
    async fn dial_to_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut t = target(false);
        t.address = addr.to_string();
        let result = GrpcDialer.dial(&t).await;
        assert!(result.is_err());
    }
}
