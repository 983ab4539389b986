//! Local batch relay.
//!
//! Producers connect over TCP and send length-delimited frames. Each request
//! frame is one signal byte (`0` traces, `1` metrics) followed by the encoded
//! export request. For every request the relay writes back one frame holding
//! a JSON [`RelayAck`], in request order.

use std::net::SocketAddr;

use anyhow::Result;
use bytes::{Buf, Bytes};
use common::{Batch, ExportError, RelayAck, Signal, StatusCode};
use futures_util::{SinkExt, StreamExt};
use otlp_exporter::ExportClient;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{
    codec::{Framed, LengthDelimitedCodec},
    sync::CancellationToken,
};
use tracing::{debug, error, info, warn};

/// Upper bound on one request frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown signal byte {0}")]
    UnknownSignal(u8),
}

/// Split a request frame into its batch.
pub fn decode_frame(mut frame: Bytes) -> Result<Batch, FrameError> {
    if frame.is_empty() {
        return Err(FrameError::Empty);
    }
    let signal = match frame.get_u8() {
        0 => Signal::Traces,
        1 => Signal::Metrics,
        other => return Err(FrameError::UnknownSignal(other)),
    };
    Ok(Batch::new(signal, frame))
}

fn ack_for(result: Result<(), ExportError>) -> RelayAck {
    match result {
        Ok(()) => RelayAck::accepted(),
        Err(e) => RelayAck::rejected(e.status_code(), e.to_string()),
    }
}

/// Accept loop. Returns when `shutdown` fires; connections already accepted
/// are left to finish their current frame.
///
/// # Errors
///
/// Returns an error only if the listener's local address cannot be read.
pub async fn run(
    listener: TcpListener,
    client: ExportClient,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "relay listening");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted producer connection");
                let client = client.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, client, shutdown).await {
                        warn!(%peer, error = %e, "producer connection error");
                    }
                });
            }
            Err(e) => error!(error = %e, "accept error"),
        }
    }

    info!("relay stopped accepting connections");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    client: ExportClient,
    shutdown: CancellationToken,
) -> Result<()> {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec();
    let mut framed = Framed::new(stream, codec);

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = framed.next() => frame,
        };
        let Some(frame) = frame else { break };

        let ack = match decode_frame(frame?.freeze()) {
            Ok(batch) => {
                debug!(%peer, signal = %batch.signal, bytes = batch.payload.len(), "relaying batch");
                ack_for(client.export(batch).await)
            }
            Err(e) => {
                warn!(%peer, error = %e, "rejecting malformed frame");
                RelayAck::rejected(Some(StatusCode::InvalidArgument), e.to_string())
            }
        };
        framed.send(Bytes::from(serde_json::to_vec(&ack)?)).await?;
    }

    debug!(%peer, "producer connection closed");
    Ok(())
}
