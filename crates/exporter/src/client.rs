//! Producer-facing export entry point.
//!
//! [`ExportClient`] turns a [`Batch`] into one or more single-shot RPCs on the
//! manager's current handle, with the retry policy for the batch's signal
//! deciding whether a failed attempt is tried again.

use std::sync::Arc;

use bytes::Bytes;
use common::{Batch, ExportError, RpcStatus, Signal, StatusCode};
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::config::CallSettings;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::retry::{self, ExportAttempt};
use crate::transport::{ExportCall, TransportError};

/// Sends encoded batches to the collector through a [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ExportClient {
    manager: ConnectionManager,
}

impl ExportClient {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Export `batch` with the configured export timeout as its deadline.
    pub async fn export(&self, batch: Batch) -> Result<(), ExportError> {
        let deadline = Instant::now() + self.manager.export_timeout();
        self.export_with_deadline(batch, deadline).await
    }

    /// Export `batch`, retrying per policy until `deadline`.
    ///
    /// # Errors
    ///
    /// - [`ExportError::Terminal`] when the collector rejects the batch or the
    ///   retry budget (attempts or deadline) is used up.
    /// - [`ExportError::Disconnected`] / [`ExportError::Dial`] when there is no
    ///   connection to use.
    /// - [`ExportError::Shutdown`] once the manager is shutting down.
    pub async fn export_with_deadline(
        &self,
        batch: Batch,
        deadline: Instant,
    ) -> Result<(), ExportError> {
        let Some(settings) = self.manager.call_settings() else {
            return Err(match self.manager.state() {
                ConnectionState::Closed => ExportError::Shutdown,
                _ => ExportError::Disconnected,
            });
        };
        let mut attempt = ExportAttempt::new(batch.signal, batch.payload, deadline);
        let policy = settings.policy(batch.signal);

        let result = retry::run(
            policy,
            &mut attempt,
            self.manager.shutdown_signal(),
            |signal, payload, deadline| {
                let settings = Arc::clone(&settings);
                async move { self.send(&settings, signal, payload, deadline).await }
            },
        )
        .await;

        match &result {
            Ok(()) => debug!(
                export_id = %attempt.id,
                signal = %batch.signal,
                attempts = attempt.number,
                "batch exported"
            ),
            Err(e) => warn!(
                export_id = %attempt.id,
                signal = %batch.signal,
                attempts = attempt.number,
                error = %e,
                "batch export failed"
            ),
        }
        result
    }

    /// Perform exactly one export RPC, without retrying.
    ///
    /// # Errors
    ///
    /// RPC failures come back as [`ExportError::Transient`] for the retry loop
    /// to judge; connection unavailability is returned as-is.
    pub async fn send_once(
        &self,
        signal: Signal,
        payload: Bytes,
        deadline: Instant,
    ) -> Result<(), ExportError> {
        let settings = self.manager.call_settings().ok_or(ExportError::Disconnected)?;
        self.send(&settings, signal, payload, deadline).await
    }

    async fn send(
        &self,
        settings: &CallSettings,
        signal: Signal,
        payload: Bytes,
        deadline: Instant,
    ) -> Result<(), ExportError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(deadline_exceeded());
        }

        let guard = self.manager.acquire(deadline).await?;
        let handle = Arc::clone(guard.handle());
        let call = ExportCall {
            signal,
            payload,
            metadata: settings.metadata.clone(),
            compression: settings.compression,
            timeout: deadline.saturating_duration_since(Instant::now()),
        };

        let outcome = tokio::select! {
            res = handle.transport().export(call) => res,
            _ = time::sleep_until(deadline) => return Err(deadline_exceeded()),
            _ = handle.aborted() => {
                return Err(ExportError::Transient(RpcStatus::new(
                    StatusCode::Cancelled,
                    "export aborted by shutdown",
                )));
            }
        };
        drop(guard);

        match outcome {
            Ok(()) => Ok(()),
            Err(TransportError::Rpc(status)) => Err(ExportError::Transient(status)),
            Err(TransportError::Broken(reason)) => {
                warn!(generation = handle.generation(), %reason, "export hit a broken connection");
                handle.mark_broken();
                Err(ExportError::Transient(RpcStatus::new(
                    StatusCode::Unavailable,
                    reason,
                )))
            }
        }
    }
}

fn deadline_exceeded() -> ExportError {
    ExportError::Transient(RpcStatus::new(
        StatusCode::DeadlineExceeded,
        "export deadline exceeded",
    ))
}
