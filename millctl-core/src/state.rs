//! Shared connection state: the lifecycle phase machine and the
//! flag set visible to external callers.
//!
//! Provides a `LinkPhase` enum that models the full multi-stage setup
//! of a relay connection, with validated transitions that return
//! `Result` instead of panicking, and a `ClientState` that publishes
//! coarse status snapshots over a `watch` channel so callers can
//! subscribe instead of polling.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::watch;

use crate::error::MillError;

// ── LinkPhase ────────────────────────────────────────────────────

/// The current phase of a relay connection.
///
/// ```text
///  Disconnected ──► Connecting ──► ProxyNegotiating ──► Handshaking ──► Active
///       ▲               │                 │                  │            │
///       │               ▼                 ▼                  ▼            ▼
///       └──────── Disconnecting ◄─────────┴──────────────────┴────────────┘
/// ```
///
/// `ProxyNegotiating` is skipped when proxy mode is disabled, and
/// `Handshaking` when the relay protocol is disabled.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LinkPhase {
    /// No active connection. Initial / terminal state.
    #[default]
    Disconnected,

    /// TCP (or TLS) connection initiated but not yet negotiated.
    Connecting,

    /// Raw socket is up; waiting for the HTTP CONNECT confirmation.
    ProxyNegotiating,

    /// Tunnel (if any) is up; exchanging the bounce-server descriptor.
    Handshaking,

    /// Every enabled stage succeeded; ready for commands and traffic.
    Active {
        /// When the connection entered the `Active` state.
        since: Instant,
    },

    /// Explicit shutdown in progress.
    Disconnecting,
}

impl std::fmt::Display for LinkPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::ProxyNegotiating => write!(f, "ProxyNegotiating"),
            Self::Handshaking => write!(f, "Handshaking"),
            Self::Active { .. } => write!(f, "Active"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

impl LinkPhase {
    /// Returns `true` when every negotiation stage has completed.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    /// Returns `true` when the connection is in a terminal or idle state.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// How long the connection has been in the `Active` state.
    ///
    /// Returns `None` for any other phase.
    pub fn active_duration(&self) -> Option<std::time::Duration> {
        match self {
            Self::Active { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Transition to `Connecting`.
    ///
    /// Valid from: `Disconnected`.
    pub fn begin_connect(&mut self) -> Result<(), MillError> {
        match self {
            Self::Disconnected => {
                *self = Self::Connecting;
                Ok(())
            }
            _ => Err(MillError::InvalidState(
                "cannot connect: not in Disconnected state",
            )),
        }
    }

    /// Transition to `ProxyNegotiating`.
    ///
    /// Valid from: `Connecting`.
    pub fn begin_proxy(&mut self) -> Result<(), MillError> {
        match self {
            Self::Connecting => {
                *self = Self::ProxyNegotiating;
                Ok(())
            }
            _ => Err(MillError::InvalidState(
                "cannot negotiate proxy: not in Connecting state",
            )),
        }
    }

    /// Transition to `Handshaking`.
    ///
    /// Valid from: `Connecting` (no proxy), `ProxyNegotiating`.
    pub fn begin_handshake(&mut self) -> Result<(), MillError> {
        match self {
            Self::Connecting | Self::ProxyNegotiating => {
                *self = Self::Handshaking;
                Ok(())
            }
            _ => Err(MillError::InvalidState(
                "cannot handshake: not in Connecting or ProxyNegotiating state",
            )),
        }
    }

    /// Transition to `Active`.
    ///
    /// Valid from: `Connecting`, `ProxyNegotiating`, `Handshaking`
    /// (whichever stage happened to be last for this configuration).
    pub fn activate(&mut self) -> Result<(), MillError> {
        match self {
            Self::Connecting | Self::ProxyNegotiating | Self::Handshaking => {
                *self = Self::Active {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(MillError::InvalidState(
                "cannot activate: negotiation not in progress",
            )),
        }
    }

    /// Transition to `Disconnecting`.
    ///
    /// Valid from: any in-progress or active state.
    pub fn begin_disconnect(&mut self) -> Result<(), MillError> {
        match self {
            Self::Connecting
            | Self::ProxyNegotiating
            | Self::Handshaking
            | Self::Active { .. } => {
                *self = Self::Disconnecting;
                Ok(())
            }
            _ => Err(MillError::InvalidState(
                "cannot disconnect: no connection in progress",
            )),
        }
    }

    /// Transition to `Disconnected`.
    ///
    /// Valid from: `Disconnecting`, or any negotiation state on failure.
    pub fn finish_disconnect(&mut self) -> Result<(), MillError> {
        match self {
            Self::Disconnecting
            | Self::Connecting
            | Self::ProxyNegotiating
            | Self::Handshaking => {
                *self = Self::Disconnected;
                Ok(())
            }
            _ => Err(MillError::InvalidState(
                "cannot finish disconnect: not in a disconnectable state",
            )),
        }
    }

    /// Force-reset to `Disconnected` regardless of current state.
    ///
    /// Use this for unrecoverable errors (e.g. I/O failure mid-stream).
    pub fn force_disconnect(&mut self) {
        *self = Self::Disconnected;
    }
}

// ── LinkStatus ───────────────────────────────────────────────────

/// A coarse status snapshot published on every state change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStatus {
    /// Every enabled negotiation stage succeeded.
    pub active: bool,
    /// `active` AND (proxy disabled OR proxy established).
    pub ready: bool,
    /// The last connect call has resolved (to success or failure).
    pub attempted: bool,
    /// The HTTP CONNECT tunnel is confirmed.
    pub proxy_established: bool,
    /// The transport dropped without an explicit disconnect request.
    pub unexpected_close: bool,
    /// Lifetime count of unexpected closes. Monotonic, so a watcher
    /// that misses an intermediate snapshot still sees the loss.
    pub unexpected_closes: u64,
    /// Cause of the last failure, if any.
    pub close_reason: Option<String>,
}

// ── ClientState ──────────────────────────────────────────────────

/// Flags shared between the I/O context and arbitrary caller threads.
///
/// Mutated only by the connection's own tasks; read from anywhere.
/// Every mutation republishes a [`LinkStatus`] snapshot.
#[derive(Debug)]
pub struct ClientState {
    active: AtomicBool,
    attempted: AtomicBool,
    proxy_enabled: AtomicBool,
    proxy_established: AtomicBool,
    unexpected_close: AtomicBool,
    unexpected_closes: AtomicU64,
    close_reason: Mutex<Option<String>>,
    status_tx: watch::Sender<LinkStatus>,
}

impl ClientState {
    pub fn new(proxy_enabled: bool) -> Self {
        let (status_tx, _) = watch::channel(LinkStatus::default());
        Self {
            active: AtomicBool::new(false),
            attempted: AtomicBool::new(false),
            proxy_enabled: AtomicBool::new(proxy_enabled),
            proxy_established: AtomicBool::new(false),
            unexpected_close: AtomicBool::new(false),
            unexpected_closes: AtomicU64::new(0),
            close_reason: Mutex::new(None),
            status_tx,
        }
    }

    // ── Reads ────────────────────────────────────────────────────

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_attempted(&self) -> bool {
        self.attempted.load(Ordering::SeqCst)
    }

    pub fn proxy_enabled(&self) -> bool {
        self.proxy_enabled.load(Ordering::SeqCst)
    }

    pub fn is_proxy_established(&self) -> bool {
        self.proxy_established.load(Ordering::SeqCst)
    }

    pub fn is_unexpected_close(&self) -> bool {
        self.unexpected_close.load(Ordering::SeqCst)
    }

    /// Active AND (proxy disabled OR proxy established).
    pub fn is_ready(&self) -> bool {
        self.is_active() && (!self.proxy_enabled() || self.is_proxy_established())
    }

    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().ok().and_then(|g| g.clone())
    }

    /// Subscribe to status snapshots. The receiver always holds the
    /// latest value; `changed().await` wakes on every transition.
    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status_tx.subscribe()
    }

    // ── Writes (connection tasks only) ───────────────────────────

    /// Reset flags at the start of a connect attempt.
    pub fn reset_for_connect(&self, proxy_enabled: bool) {
        self.active.store(false, Ordering::SeqCst);
        self.attempted.store(false, Ordering::SeqCst);
        self.proxy_enabled.store(proxy_enabled, Ordering::SeqCst);
        self.proxy_established.store(false, Ordering::SeqCst);
        self.unexpected_close.store(false, Ordering::SeqCst);
        if let Ok(mut g) = self.close_reason.lock() {
            *g = None;
        }
        self.publish();
    }

    /// Mark the proxy tunnel confirmed. Signalled exactly once per
    /// connection attempt.
    pub fn set_proxy_established(&self) {
        self.proxy_established.store(true, Ordering::SeqCst);
        self.publish();
    }

    /// Every enabled stage succeeded: the connect attempt resolved.
    pub fn set_active(&self) {
        self.active.store(true, Ordering::SeqCst);
        self.attempted.store(true, Ordering::SeqCst);
        self.publish();
    }

    /// A connect attempt resolved to failure.
    pub fn fail_connect(&self, reason: &str) {
        self.active.store(false, Ordering::SeqCst);
        self.attempted.store(true, Ordering::SeqCst);
        if let Ok(mut g) = self.close_reason.lock() {
            *g = Some(reason.to_string());
        }
        self.publish();
    }

    /// The established transport went down.
    ///
    /// `expected` is true when the owner explicitly requested the
    /// close; anything else flags an unexpected close.
    pub fn transport_down(&self, expected: bool, reason: &str) {
        self.active.store(false, Ordering::SeqCst);
        self.attempted.store(true, Ordering::SeqCst);
        self.proxy_established.store(false, Ordering::SeqCst);
        self.unexpected_close.store(!expected, Ordering::SeqCst);
        if !expected {
            self.unexpected_closes.fetch_add(1, Ordering::SeqCst);
        }
        if let Ok(mut g) = self.close_reason.lock() {
            *g = Some(reason.to_string());
        }
        self.publish();
    }

    fn publish(&self) {
        let snapshot = LinkStatus {
            active: self.is_active(),
            ready: self.is_ready(),
            attempted: self.is_attempted(),
            proxy_established: self.is_proxy_established(),
            unexpected_close: self.is_unexpected_close(),
            unexpected_closes: self.unexpected_closes.load(Ordering::SeqCst),
            close_reason: self.close_reason(),
        };
        // send_replace never fails even with no subscribers.
        self.status_tx.send_replace(snapshot);
    }
}

// ── Tests ────────────────────────────────────────────────────────
