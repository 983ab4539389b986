//! Bounded retry loop around single export attempts.
//!
//! # Lifecycle of a batch
//!
//! 1. The client creates an [`ExportAttempt`] holding the payload, an attempt
//!    counter starting at 1, and the deadline for the whole export.
//! 2. [`run`] invokes the single-shot operation.
//! 3. A [`ExportError::Transient`] failure is checked against the
//!    [`RetryPolicy`]: retryable codes below `max_attempts` sleep for the
//!    computed backoff and go again; everything else becomes
//!    [`ExportError::Terminal`].
//! 4. Non-RPC failures (shutdown, disconnected, dial) are returned untouched.
//!
//! The loop is independent of the connection's own reconnect cycle: it never
//! looks at connection state, it only sees what each attempt returns.

pub mod policy;

pub use policy::{PolicyError, RetryPolicy, MAX_ATTEMPTS_CEILING};

use std::future::Future;

use bytes::Bytes;
use common::{ExportError, RpcStatus, Signal, StatusCode};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// State of one outbound batch while it is being delivered.
#[derive(Debug, Clone)]
pub struct ExportAttempt {
    /// Correlation id for logs.
    pub id: Uuid,
    pub signal: Signal,
    pub payload: Bytes,
    /// 1-based number of the attempt in progress.
    pub number: u32,
    /// Deadline for the whole export, retries included.
    pub deadline: Instant,
}

impl ExportAttempt {
    pub fn new(signal: Signal, payload: Bytes, deadline: Instant) -> Self {
        Self {
            id: Uuid::new_v4(),
            signal,
            payload,
            number: 1,
            deadline,
        }
    }
}

/// Drive `op` until it succeeds, fails terminally, or is cancelled.
///
/// Each call to `op` gets the signal, a cheap clone of the payload and the
/// export deadline, and must perform exactly one RPC.
///
/// Backoff waits end early with [`ExportError::Shutdown`] when `cancel` fires,
/// and with a terminal `DEADLINE_EXCEEDED` when the export deadline passes.
///
/// # Errors
///
/// Returns [`ExportError::Terminal`] when the policy gives up, or whatever
/// non-RPC error `op` produced.
pub async fn run<F, Fut>(
    policy: &RetryPolicy,
    attempt: &mut ExportAttempt,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<(), ExportError>
where
    F: FnMut(Signal, Bytes, Instant) -> Fut,
    Fut: Future<Output = Result<(), ExportError>>,
{
    loop {
        if cancel.is_cancelled() {
            return Err(ExportError::Shutdown);
        }

        let status = match op(attempt.signal, attempt.payload.clone(), attempt.deadline).await {
            Ok(()) => return Ok(()),
            Err(ExportError::Transient(status)) => status,
            Err(other) => return Err(other),
        };
        if cancel.is_cancelled() {
            return Err(ExportError::Shutdown);
        }

        let Some(backoff) = policy.next_backoff(attempt.number, status.code) else {
            return Err(ExportError::Terminal {
                status,
                attempts: attempt.number,
            });
        };

        debug!(
            export_id = %attempt.id,
            signal = %attempt.signal,
            attempt = attempt.number,
            code = %status.code,
            backoff_ms = backoff.as_millis() as u64,
            "retryable export failure; backing off"
        );

        // Deadline before backoff: a wait that ends exactly at the deadline
        // is terminal.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExportError::Shutdown),
            _ = time::sleep_until(attempt.deadline) => {
                return Err(ExportError::Terminal {
                    status: RpcStatus::new(
                        StatusCode::DeadlineExceeded,
                        format!("export deadline passed while backing off after: {status}"),
                    ),
                    attempts: attempt.number,
                });
            }
            _ = time::sleep(backoff) => {}
        }

        attempt.number += 1;
    }
}
