//! Scripted dialer and transport used by unit tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{DialError, Dialer, ExportCall, Transport, TransportError};
use crate::config::DialTarget;

#[derive(Default)]
struct TransportState {
    outcomes: Mutex<VecDeque<Result<(), TransportError>>>,
    calls: Mutex<Vec<ExportCall>>,
    delay: Mutex<Duration>,
    lost: CancellationToken,
    closes: AtomicUsize,
    finished: AtomicUsize,
}

/// Transport whose export results are scripted; succeeds once the script runs out.
#[derive(Clone, Default)]
pub(crate) struct FakeTransport {
    state: Arc<TransportState>,
}

impl FakeTransport {
    pub(crate) fn with_outcomes(outcomes: Vec<Result<(), TransportError>>) -> Self {
        let t = Self::default();
        *t.state.outcomes.lock().unwrap() = outcomes.into();
        t
    }

    /// Make every export take `delay` before answering.
    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = delay;
    }

    /// Simulate keepalive loss.
    pub(crate) fn lose_connection(&self) {
        self.state.lost.cancel();
    }

    pub(crate) fn calls(&self) -> Vec<ExportCall> {
        self.state.calls.lock().unwrap().clone()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Exports that ran to completion (not dropped mid-flight).
    pub(crate) fn finished_count(&self) -> usize {
        self.state.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn export(&self, call: ExportCall) -> Result<(), TransportError> {
        self.state.calls.lock().unwrap().push(call);
        let delay = *self.state.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state.finished.fetch_add(1, Ordering::SeqCst);
        self.state.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn closed(&self) {
        self.state.lost.cancelled().await
    }

    async fn close(&self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct DialerState {
    script: Mutex<VecDeque<Result<FakeTransport, DialError>>>,
    dials: Mutex<Vec<Instant>>,
    transports: Mutex<Vec<FakeTransport>>,
}

/// Dialer that follows a script of outcomes, then keeps succeeding with fresh
/// [`FakeTransport`]s.
#[derive(Clone, Default)]
pub(crate) struct FakeDialer {
    state: Arc<DialerState>,
}

impl FakeDialer {
    pub(crate) fn with_script(script: Vec<Result<FakeTransport, DialError>>) -> Self {
        let d = Self::default();
        *d.state.script.lock().unwrap() = script.into();
        d
    }

    /// Dialer whose first `n` dials are refused.
    pub(crate) fn failing(n: usize) -> Self {
        Self::with_script(
            (0..n)
                .map(|i| Err(DialError(format!("connection refused ({i})"))))
                .collect(),
        )
    }

    pub(crate) fn dial_times(&self) -> Vec<Instant> {
        self.state.dials.lock().unwrap().clone()
    }

    pub(crate) fn dial_count(&self) -> usize {
        self.state.dials.lock().unwrap().len()
    }

    /// Every transport handed out so far, oldest first.
    pub(crate) fn transports(&self) -> Vec<FakeTransport> {
        self.state.transports.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    async fn dial(&self, _target: &DialTarget) -> Result<Box<dyn Transport>, DialError> {
        self.state.dials.lock().unwrap().push(Instant::now());
        let next = self
            .state
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(FakeTransport::default()));
        let transport = next?;
        self.state.transports.lock().unwrap().push(transport.clone());
        Ok(Box::new(transport))
    }
}
