//! Application-level liveness monitoring over an active connection.
//!
//! Periodic ping/pong exchange that yields a coarse "peer reachable"
//! signal distinct from "socket open". On each tick: if the previous
//! ping is still unacknowledged the peer is declared unreachable (the
//! transport stays open) and that ping is written off; otherwise a new
//! ping goes out. At most one ping is outstanding at any instant.
//!
//! The monitor only ticks while the connection is active and stops
//! the instant it goes down. Inbound ping traffic is decoded by the
//! channel client, which calls [`LivenessMonitor::on_ping_response`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::net::client::MillClient;
use crate::wire;

/// Default tick cadence, matching the mill firmware's expectations.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(3);

struct MonitorShared {
    /// One unacknowledged ping at most; cleared by pong or written
    /// off by the next tick.
    outstanding: AtomicBool,
    reachable_tx: watch::Sender<bool>,
    /// Token for the current tick loop; replaced on every activation.
    activation: Mutex<CancellationToken>,
}

impl MonitorShared {
    fn set_reachable(&self, reachable: bool) {
        // Notify on transitions only, so waiters observe real changes.
        self.reachable_tx.send_if_modified(|v| {
            if *v != reachable {
                *v = reachable;
                true
            } else {
                false
            }
        });
    }
}

/// Drives the ping schedule for one connection.
///
/// Holds only a non-owning handle to the client; dropping the monitor
/// cancels its timer task.
pub struct LivenessMonitor {
    shared: Arc<MonitorShared>,
    token: CancellationToken,
}

impl LivenessMonitor {
    /// Spawn the monitor task. It idles until the client reports
    /// active, ticks while it stays active, and suspends again on any
    /// transport loss.
    pub fn spawn(client: Arc<MillClient>, interval: Duration) -> Self {
        let (reachable_tx, _) = watch::channel(false);
        let token = CancellationToken::new();
        let shared = Arc::new(MonitorShared {
            outstanding: AtomicBool::new(false),
            reachable_tx,
            activation: Mutex::new(token.child_token()),
        });

        tokio::spawn(run(
            client,
            interval,
            Arc::clone(&shared),
            token.clone(),
        ));

        Self { shared, token }
    }

    /// Latest coarse reachability signal.
    pub fn is_peer_reachable(&self) -> bool {
        *self.shared.reachable_tx.borrow()
    }

    /// Subscribe to reachability transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shared.reachable_tx.subscribe()
    }

    /// Block until the next reachability transition or the timeout.
    ///
    /// Returns `true` if a transition was observed in time. Used by
    /// collaborators that need a definitive "is the device responding
    /// right now" answer rather than the periodic signal.
    pub async fn wait_for_change(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.reachable_tx.subscribe();
        rx.borrow_and_update();
        matches!(
            tokio::time::timeout(timeout, rx.changed()).await,
            Ok(Ok(()))
        )
    }

    /// Record a ping response from the peer.
    pub fn on_ping_response(&self) {
        self.shared.outstanding.store(false, Ordering::SeqCst);
        self.shared.set_reachable(true);
    }

    /// Cloneable handle for the task that decodes inbound bytes.
    pub fn shared_handle(&self) -> MonitorHandle {
        MonitorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Whether a ping is currently awaiting acknowledgement.
    pub fn is_ping_outstanding(&self) -> bool {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    /// Stop ticking until the next activation. Used by an explicit
    /// disconnect so no ping races the transport teardown; the monitor
    /// resumes on the next active connection.
    pub fn halt(&self) {
        if let Ok(activation) = self.shared.activation.lock() {
            activation.cancel();
        }
        self.shared.outstanding.store(false, Ordering::SeqCst);
        self.shared.set_reachable(false);
    }

    /// Stop the monitor permanently.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Pong-reporting handle held by the inbound decoder.
#[derive(Clone)]
pub struct MonitorHandle {
    shared: Arc<MonitorShared>,
}

impl MonitorHandle {
    pub fn on_ping_response(&self) {
        self.shared.outstanding.store(false, Ordering::SeqCst);
        self.shared.set_reachable(true);
    }
}

async fn run(
    client: Arc<MillClient>,
    interval: Duration,
    shared: Arc<MonitorShared>,
    token: CancellationToken,
) {
    let mut status = client.status_watch();

    loop {
        // Idle until the connection is active.
        while !status.borrow_and_update().active {
            tokio::select! {
                _ = token.cancelled() => return,
                changed = status.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        debug!(name = %client.name(), "liveness monitor started");
        shared.outstanding.store(false, Ordering::SeqCst);

        let activation = token.child_token();
        if let Ok(mut slot) = shared.activation.lock() {
            *slot = activation.clone();
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = activation.cancelled() => {
                    debug!(name = %client.name(), "liveness monitor halted");
                    // Stay quiet until this connection actually goes
                    // down, then idle for the next one.
                    while status.borrow_and_update().active {
                        tokio::select! {
                            _ = token.cancelled() => return,
                            changed = status.changed() => {
                                if changed.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    break;
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if !status.borrow_and_update().active {
                        // Transport down: no further ticks.
                        shared.outstanding.store(false, Ordering::SeqCst);
                        shared.set_reachable(false);
                        debug!(name = %client.name(), "liveness monitor suspended");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if shared.outstanding.swap(false, Ordering::SeqCst) {
                        // Previous ping written off as lost.
                        trace!(name = %client.name(), "ping unacknowledged");
                        shared.set_reachable(false);
                    } else if client.write_byte(wire::PING_REQUEST).await.is_ok() {
                        shared.outstanding.store(true, Ordering::SeqCst);
                        trace!(name = %client.name(), "ping sent");
                    }
                    // A failed write means the connection is racing
                    // down; the status arm will observe it.
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
