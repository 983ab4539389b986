//! [`TransportHandle`]: a shared, reference-counted live connection.

use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::{Notify, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transport::Transport;

/// One established connection plus the bookkeeping needed to replace it
/// safely while exports are using it.
///
/// Handles are never mutated in place: reconnecting creates a new handle
/// and the old one is drained, then closed, on its own schedule.
pub struct TransportHandle {
    generation: u64,
    transport: Box<dyn Transport>,
    inflight: AtomicUsize,
    idle: Notify,
    broken: CancellationToken,
    aborted: CancellationToken,
    closed: OnceCell<()>,
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("generation", &self.generation)
            .field("inflight", &self.inflight())
            .field("broken", &self.is_broken())
            .finish_non_exhaustive()
    }
}

impl TransportHandle {
    pub(crate) fn new(generation: u64, transport: Box<dyn Transport>) -> Self {
        Self {
            generation,
            transport,
            inflight: AtomicUsize::new(0),
            idle: Notify::new(),
            broken: CancellationToken::new(),
            aborted: CancellationToken::new(),
            closed: OnceCell::new(),
        }
    }

    /// Monotonic connection number, starting at 1.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Number of exports currently using this handle.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Register an export on this handle until the guard is dropped.
    pub fn begin(self: &Arc<Self>) -> InflightGuard {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        InflightGuard {
            handle: Arc::clone(self),
        }
    }

    /// Flag the connection as failed. The connection manager reacts by
    /// moving to `Reconnecting`.
    pub fn mark_broken(&self) {
        if !self.broken.is_cancelled() {
            debug!(generation = self.generation, "transport handle marked broken");
        }
        self.broken.cancel();
    }

    pub fn is_broken(&self) -> bool {
        self.broken.is_cancelled()
    }

    /// Resolves when an export marked the handle broken or the transport
    /// reported the connection lost.
    pub async fn broken(&self) {
        tokio::select! {
            _ = self.broken.cancelled() => {}
            _ = self.transport.closed() => self.broken.cancel(),
        }
    }

    /// Resolves when the handle is being torn down with exports still in flight.
    pub async fn aborted(&self) {
        self.aborted.cancelled().await
    }

    /// Resolves once no export holds this handle.
    pub async fn drained(&self) {
        loop {
            let notified = self.idle.notified();
            if self.inflight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait up to `grace` for in-flight exports, abort any that remain, then
    /// close the transport.
    ///
    /// May run concurrently with other releases of the same handle: the
    /// shortest grace decides when exports are aborted, and the transport is
    /// closed once. Every caller returns only after the close has completed.
    pub(crate) async fn release(&self, grace: Duration) {
        self.broken.cancel();
        if tokio::time::timeout(grace, self.drained()).await.is_err() && !self.aborted.is_cancelled() {
            warn!(
                generation = self.generation,
                inflight = self.inflight(),
                grace_ms = grace.as_millis() as u64,
                "grace period expired; aborting in-flight exports"
            );
            self.aborted.cancel();
        }
        self.closed
            .get_or_init(|| async {
                self.transport.close().await;
                debug!(generation = self.generation, "transport handle released");
            })
            .await;
    }
}

/// Keeps a handle counted as in use. Dropping it may wake a pending drain.
#[derive(Debug)]
pub struct InflightGuard {
    handle: Arc<TransportHandle>,
}

impl InflightGuard {
    pub fn handle(&self) -> &Arc<TransportHandle> {
        &self.handle
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.handle.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.handle.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeTransport;

    fn handle() -> (Arc<TransportHandle>, FakeTransport) {
        let fake = FakeTransport::default();
        (Arc::new(TransportHandle::new(1, Box::new(fake.clone()))), fake)
    }

    #[test]
    fn guards_count_inflight_exports() {
        let (h, _) = handle();
        let a = h.begin();
        let b = h.begin();
        assert_eq!(h.inflight(), 2);
        drop(a);
        assert_eq!(h.inflight(), 1);
        drop(b);
        assert_eq!(h.inflight(), 0);
    }

    #[tokio::test]
    async fn drained_returns_immediately_when_idle() {
        let (h, _) = handle();
        tokio::time::timeout(Duration::from_millis(50), h.drained())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn release_waits_for_inflight_export() {
        let (h, fake) = handle();
        let guard = h.begin();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(guard);
        });

        let start = tokio::time::Instant::now();
        h.release(Duration::from_secs(5)).await;
        assert_eq!(start.elapsed(), Duration::from_millis(200));
        assert!(!h.aborted.is_cancelled());
        assert_eq!(fake.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn release_aborts_after_grace() {
        let (h, fake) = handle();
        let _guard = h.begin();
        h.release(Duration::from_millis(100)).await;
        assert!(h.aborted.is_cancelled());
        assert_eq!(fake.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shorter_concurrent_release_wins_and_closes_once() {
        let (h, fake) = handle();
        let guard = h.begin();
        assert_eq!(guard.handle().generation(), 1);

        let background = tokio::spawn({
            let h = Arc::clone(&h);
            async move { h.release(Duration::from_secs(30)).await }
        });
        let start = tokio::time::Instant::now();
        h.release(Duration::from_secs(1)).await;
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert!(h.aborted.is_cancelled());

        drop(guard);
        background.await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(fake.close_count(), 1);
    }

    #[tokio::test]
    async fn transport_loss_marks_broken() {
        let (h, fake) = handle();
        assert!(!h.is_broken());
        fake.lose_connection();
        h.broken().await;
        assert!(h.is_broken());
    }
}
