//! [`ConnectionManager`]: owns the live transport handle and the
//! connect/reconnect loop.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use common::ExportError;
use futures_util::future::join_all;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    handle::{InflightGuard, TransportHandle},
    ConnectionState,
};
use crate::config::{CallSettings, ConnectionConfig, DisconnectedExports, ResolvedConfig};
use crate::transport::{grpc::GrpcDialer, Dialer};

/// State and current handle, always replaced together.
#[derive(Debug)]
struct Link {
    state: ConnectionState,
    current: Option<Arc<TransportHandle>>,
    ever_connected: bool,
    last_dial_error: Option<String>,
}

impl Link {
    /// Error for an export that found no usable connection.
    fn unavailable(&self) -> ExportError {
        match (&self.state, self.ever_connected, &self.last_dial_error) {
            (ConnectionState::Closed, _, _) => ExportError::Shutdown,
            (_, false, Some(err)) => ExportError::Dial(err.clone()),
            _ => ExportError::Disconnected,
        }
    }

    fn usable(&self) -> Option<Arc<TransportHandle>> {
        match (&self.state, &self.current) {
            (ConnectionState::Connected, Some(h)) if !h.is_broken() => Some(Arc::clone(h)),
            _ => None,
        }
    }
}

struct Shared {
    config: ConnectionConfig,
    dialer: Arc<dyn Dialer>,
    resolved: OnceLock<ResolvedConfig>,
    link: watch::Sender<Link>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Superseded handles still waiting for their exports to finish.
    draining: Mutex<Vec<Arc<TransportHandle>>>,
    generation: AtomicU64,
}

impl Shared {
    /// Move to `to` unless closed. Returns `false` once the manager is closed.
    fn transition(&self, to: ConnectionState) -> bool {
        let mut open = true;
        self.link.send_if_modified(|link| {
            if link.state == ConnectionState::Closed {
                open = false;
                return false;
            }
            if link.state == to {
                return false;
            }
            debug!(from = %link.state, to = %to, "connection state transition");
            link.state = to;
            true
        });
        open
    }

    fn record_dial_failure(&self, error: String) -> bool {
        let mut open = true;
        self.link.send_if_modified(|link| {
            if link.state == ConnectionState::Closed {
                open = false;
                return false;
            }
            link.state = ConnectionState::Reconnecting;
            link.last_dial_error = Some(error);
            true
        });
        open
    }

    /// Make `handle` current, returning the handle it replaced.
    /// `None` if the manager closed meanwhile.
    fn install(&self, handle: &Arc<TransportHandle>) -> Option<Option<Arc<TransportHandle>>> {
        let mut open = true;
        let mut superseded = None;
        self.link.send_if_modified(|link| {
            if link.state == ConnectionState::Closed {
                open = false;
                return false;
            }
            superseded = link.current.replace(Arc::clone(handle));
            link.state = ConnectionState::Connected;
            link.ever_connected = true;
            link.last_dial_error = None;
            true
        });
        open.then_some(superseded)
    }

    /// `Connected → Reconnecting`, taking `handle` out of the current slot.
    fn retire(&self, handle: &Arc<TransportHandle>) -> Option<Option<Arc<TransportHandle>>> {
        let mut stale = None;
        let mut open = true;
        self.link.send_if_modified(|link| {
            if link.state == ConnectionState::Closed {
                open = false;
                return false;
            }
            if link
                .current
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, handle))
            {
                stale = link.current.take();
            }
            link.state = ConnectionState::Reconnecting;
            true
        });
        open.then_some(stale)
    }
}

/// Owns the single current connection to the collector.
///
/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Manager that dials over gRPC.
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_dialer(config, Arc::new(GrpcDialer))
    }

    /// Manager that opens connections with `dialer`.
    pub fn with_dialer(config: ConnectionConfig, dialer: Arc<dyn Dialer>) -> Self {
        let (link, _) = watch::channel(Link {
            state: ConnectionState::Disconnected,
            current: None,
            ever_connected: false,
            last_dial_error: None,
        });
        Self {
            shared: Arc::new(Shared {
                config,
                dialer,
                resolved: OnceLock::new(),
                link,
                shutdown: CancellationToken::new(),
                task: Mutex::new(None),
                draining: Mutex::new(Vec::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Validate the configuration and start connecting in the background.
    ///
    /// Calling `start` on a running manager does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Config`] before any network activity if the
    /// configuration is invalid, or [`ExportError::Shutdown`] after
    /// [`ConnectionManager::shutdown`].
    pub async fn start(&self) -> Result<(), ExportError> {
        let mut task = self.shared.task.lock().await;
        match self.state() {
            ConnectionState::Closed => return Err(ExportError::Shutdown),
            ConnectionState::Disconnected => {}
            _ => return Ok(()),
        }

        let resolved = self.shared.config.resolve().map_err(|e| {
            warn!(error = %e, "rejecting collector connection configuration");
            e
        })?;
        let resolved = self.shared.resolved.get_or_init(|| resolved).clone();

        if !self.shared.transition(ConnectionState::Connecting) {
            return Err(ExportError::Shutdown);
        }
        info!(
            address = %resolved.dial.address,
            tls = resolved.dial.credentials.is_some(),
            reconnection_period_ms = resolved.reconnection_period.as_millis() as u64,
            "starting collector connection"
        );
        *task = Some(tokio::spawn(connection_loop(
            Arc::clone(&self.shared),
            resolved,
        )));
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.link.borrow().state
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> StateReceiver {
        StateReceiver {
            rx: self.shared.link.subscribe(),
        }
    }

    /// Per-call settings; available once [`ConnectionManager::start`] succeeded.
    pub fn call_settings(&self) -> Option<Arc<CallSettings>> {
        self.shared.resolved.get().map(|r| Arc::clone(&r.calls))
    }

    /// Default per-batch deadline budget.
    pub fn export_timeout(&self) -> Duration {
        self.shared
            .resolved
            .get()
            .map_or(crate::config::DEFAULT_EXPORT_TIMEOUT, |r| r.export_timeout)
    }

    /// Fires when the manager starts shutting down.
    pub(crate) fn shutdown_signal(&self) -> &CancellationToken {
        &self.shared.shutdown
    }

    /// Register an export on the current handle, according to the
    /// disconnected-exports policy.
    ///
    /// The guard is taken before the handle can be retired, so a release
    /// racing with this call always sees the export in flight.
    ///
    /// # Errors
    ///
    /// - [`ExportError::Shutdown`] once closed.
    /// - [`ExportError::Dial`] if no connection was ever established and a
    ///   dial attempt has failed.
    /// - [`ExportError::Disconnected`] otherwise, immediately in fail-fast
    ///   mode or at `deadline` when waiting for a reconnect.
    pub async fn acquire(&self, deadline: Instant) -> Result<InflightGuard, ExportError> {
        let policy = self
            .shared
            .resolved
            .get()
            .map_or(DisconnectedExports::FailFast, |r| r.disconnected_exports);
        let mut rx = self.shared.link.subscribe();

        let unavailable = {
            let link = rx.borrow_and_update();
            if let Some(handle) = link.usable() {
                return Ok(handle.begin());
            }
            link.unavailable()
        };
        if matches!(unavailable, ExportError::Shutdown) || policy == DisconnectedExports::FailFast {
            return Err(unavailable);
        }

        let waited = match time::timeout_at(
            deadline,
            rx.wait_for(|l| l.usable().is_some() || l.state == ConnectionState::Closed),
        )
        .await
        {
            Ok(Ok(link)) => Some(
                link.usable()
                    .map(|h| h.begin())
                    .ok_or_else(|| link.unavailable()),
            ),
            Ok(Err(_)) => Some(Err(ExportError::Shutdown)),
            Err(_) => None,
        };
        match waited {
            Some(result) => result,
            None => Err(rx.borrow().unavailable()),
        }
    }

    /// Wait until a connection is established.
    ///
    /// # Errors
    ///
    /// [`ExportError::Shutdown`] if the manager closes first; at `deadline`,
    /// [`ExportError::Dial`] when no connection was ever made, else
    /// [`ExportError::Disconnected`].
    pub async fn wait_connected(&self, deadline: Instant) -> Result<(), ExportError> {
        let mut rx = self.shared.link.subscribe();
        let reached = match time::timeout_at(
            deadline,
            rx.wait_for(|l| {
                matches!(l.state, ConnectionState::Connected | ConnectionState::Closed)
            }),
        )
        .await
        {
            Ok(Ok(link)) => Some(link.state),
            Ok(Err(_)) => Some(ConnectionState::Closed),
            Err(_) => None,
        };
        match reached {
            Some(ConnectionState::Connected) => Ok(()),
            Some(_) => Err(ExportError::Shutdown),
            None => Err(rx.borrow().unavailable()),
        }
    }

    /// Stop reconnecting and release every handle: the current one and any
    /// superseded handle still draining.
    ///
    /// In-flight exports get up to `grace` to finish; any still running are
    /// then aborted and the transports are closed before this returns. Safe to call from any state;
    /// calls after the first return immediately.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), ExportError> {
        let mut already_closed = false;
        let mut current = None;
        self.shared.link.send_if_modified(|link| {
            if link.state == ConnectionState::Closed {
                already_closed = true;
                return false;
            }
            debug!(from = %link.state, "connection state transition to closed");
            link.state = ConnectionState::Closed;
            current = link.current.take();
            true
        });
        if already_closed {
            return Ok(());
        }

        self.shared.shutdown.cancel();
        if let Some(task) = self.shared.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "connection task ended abnormally");
            }
        }
        let draining = std::mem::take(&mut *self.shared.draining.lock().await);
        let handles: Vec<_> = current.into_iter().chain(draining).collect();
        join_all(handles.iter().map(|h| h.release(grace))).await;
        info!(released = handles.len(), "collector connection shut down");
        Ok(())
    }
}

/// Background task: dial, hold the connection until it breaks, wait the
/// fixed reconnection period, repeat. Exits when shutdown is signalled.
async fn connection_loop(shared: Arc<Shared>, cfg: ResolvedConfig) {
    let address = cfg.dial.address.as_str();
    let mut failures: u64 = 0;

    loop {
        if !shared.transition(ConnectionState::Connecting) {
            return;
        }

        let dialed = tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            result = time::timeout(cfg.dial.dial_timeout, shared.dialer.dial(&cfg.dial)) => result,
        };
        let dialed = match dialed {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!(
                "dial timed out after {}ms",
                cfg.dial.dial_timeout.as_millis()
            )),
        };

        match dialed {
            Ok(transport) => {
                failures = 0;
                let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let handle = Arc::new(TransportHandle::new(generation, transport));
                match shared.install(&handle) {
                    Some(Some(old)) => drain_in_background(&shared, old, cfg.drain_timeout).await,
                    Some(None) => {}
                    None => {
                        handle.release(Duration::ZERO).await;
                        return;
                    }
                }
                info!(generation, address, "connected to collector");

                tokio::select! {
                    _ = shared.shutdown.cancelled() => return,
                    _ = handle.broken() => {}
                }

                warn!(generation, address, "collector connection lost; reconnecting");
                match shared.retire(&handle) {
                    Some(Some(stale)) => {
                        drain_in_background(&shared, stale, cfg.drain_timeout).await;
                    }
                    Some(None) => {}
                    None => return,
                }
            }
            Err(error) => {
                failures += 1;
                warn!(
                    address,
                    error = %error,
                    consecutive_failures = failures,
                    retry_in_ms = cfg.reconnection_period.as_millis() as u64,
                    "failed to connect to collector"
                );
                if !shared.record_dial_failure(error) {
                    return;
                }
            }
        }

        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = time::sleep(cfg.reconnection_period) => {}
        }
    }
}

/// Close `handle` once its exports finish or `drain` runs out. Tracked in
/// `draining` so that shutdown can cut the wait short.
async fn drain_in_background(shared: &Arc<Shared>, handle: Arc<TransportHandle>, drain: Duration) {
    shared.draining.lock().await.push(Arc::clone(&handle));
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        handle.release(drain).await;
        shared
            .draining
            .lock()
            .await
            .retain(|h| !Arc::ptr_eq(h, &handle));
    });
}

/// Receiver side of the manager's state, for observers and tests.
pub struct StateReceiver {
    rx: watch::Receiver<Link>,
}

impl StateReceiver {
    pub fn current(&self) -> ConnectionState {
        self.rx.borrow().state
    }

    /// Wait for the next transition and return the new state.
    ///
    /// Rapid transitions may be coalesced; only the latest state is seen.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Shutdown`] if the manager was dropped.
    pub async fn changed(&mut self) -> Result<ConnectionState, ExportError> {
        self.rx
            .changed()
            .await
            .map_err(|_| ExportError::Shutdown)?;
        Ok(self.rx.borrow_and_update().state)
    }

    /// Wait until the manager is in `state`.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Shutdown`] if the manager was dropped first.
    pub async fn wait_for(&mut self, state: ConnectionState) -> Result<(), ExportError> {
        self.rx
            .wait_for(|l| l.state == state)
            .await
            .map(|_| ())
            .map_err(|_| ExportError::Shutdown)
    }
}
