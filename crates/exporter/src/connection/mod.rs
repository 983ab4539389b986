//! Collector connection lifecycle.
//!
//! # States
//!
//! ```text
//!                 start()            dial ok
//! Disconnected ───────────► Connecting ───────► Connected
//!                              ▲   │                │
//!                  timer fires │   │ dial failed    │ transport lost
//!                              │   ▼                │
//!                           Reconnecting ◄──────────┘
//!
//! any state ── shutdown() ──► Closed
//! ```
//!
//! # Invariants
//!
//! - The state and the current [`TransportHandle`] change together, under one
//!   lock, and only ever by whole-value replacement.
//! - The wait in `Reconnecting` is a fixed `reconnection_period`; it has
//!   nothing to do with the per-call retry backoff.
//! - Exports that still hold a superseded handle finish on it; the old
//!   handle is closed only after they drain (or its grace runs out).
//! - Nothing leaves `Closed`.

pub mod handle;
pub mod manager;

pub use handle::{InflightGuard, TransportHandle};
pub use manager::{ConnectionManager, StateReceiver};

use std::fmt;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not started yet.
    Disconnected,
    /// A dial attempt is in progress.
    Connecting,
    /// A live handle is available for exports.
    Connected,
    /// Waiting out the reconnection period before the next dial.
    Reconnecting,
    /// Shut down; terminal.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}
