//! Automatic reconnection with exponential backoff.
//!
//! The supervisor watches a client's status stream and opens a retry
//! episode whenever the transport is lost without an explicit
//! disconnect request. Each episode attempts the full connect
//! sequence (proxy + relay handshake), sleeping between failures with
//! a doubling delay: 1, 2, 4, 8, 16, … units. Episodes are
//! cooperatively cancellable at the wait boundary; an in-flight
//! attempt is allowed to finish before the episode stops.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::net::client::MillClient;

// ── Backoff ──────────────────────────────────────────────────────

/// Exponential backoff progression for one retry episode.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    next_delay: Duration,
    try_count: u32,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            next_delay: base,
            try_count: 1,
        }
    }

    /// Attempt number of the upcoming try (starts at 1).
    pub fn try_count(&self) -> u32 {
        self.try_count
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&self) -> Duration {
        self.next_delay
    }

    /// Record a failed attempt: returns the delay to sleep, then
    /// doubles it and bumps the counter.
    pub fn advance(&mut self) -> Duration {
        let delay = self.next_delay;
        self.next_delay = self.next_delay.saturating_mul(2);
        self.try_count += 1;
        delay
    }

    /// Reset after a successful reconnect.
    pub fn reset(&mut self) {
        self.next_delay = self.base;
        self.try_count = 1;
    }
}

// ── ReconnectStatus ──────────────────────────────────────────────

/// Caller-visible state of the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReconnectStatus {
    /// No episode in progress.
    #[default]
    Idle,
    /// An episode is running; `try_count` is the attempt about to run
    /// or running, `next_delay` the sleep after it fails.
    Trying {
        try_count: u32,
        next_delay: Duration,
    },
}

/// Backoff tuning for the supervisor.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// First inter-attempt delay; doubles per failure.
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
        }
    }
}

// ── ReconnectSupervisor ──────────────────────────────────────────

/// Watches for unexpected transport loss and retries the connection.
pub struct ReconnectSupervisor {
    root: CancellationToken,
    episode: Arc<Mutex<CancellationToken>>,
    status_rx: watch::Receiver<ReconnectStatus>,
}

impl ReconnectSupervisor {
    /// Spawn the supervisor task for `client`.
    pub fn spawn(client: Arc<MillClient>, policy: ReconnectPolicy) -> Self {
        let root = CancellationToken::new();
        let episode = Arc::new(Mutex::new(root.child_token()));
        let (status_tx, status_rx) = watch::channel(ReconnectStatus::Idle);

        tokio::spawn(run(
            client,
            policy,
            root.clone(),
            Arc::clone(&episode),
            status_tx,
        ));

        Self {
            root,
            episode,
            status_rx,
        }
    }

    /// Latest supervisor status.
    pub fn status(&self) -> ReconnectStatus {
        self.status_rx.borrow().clone()
    }

    /// Subscribe to status transitions.
    pub fn subscribe(&self) -> watch::Receiver<ReconnectStatus> {
        self.status_rx.clone()
    }

    /// Cancel the current episode, if any. The supervisor stays alive
    /// and will open a new episode on the next unexpected close.
    pub fn cancel_episode(&self) {
        if let Ok(token) = self.episode.lock() {
            token.cancel();
        }
    }

    /// Stop the supervisor permanently.
    pub fn shutdown(&self) {
        self.root.cancel();
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

async fn run(
    client: Arc<MillClient>,
    policy: ReconnectPolicy,
    root: CancellationToken,
    episode_slot: Arc<Mutex<CancellationToken>>,
    status_tx: watch::Sender<ReconnectStatus>,
) {
    let mut status = client.status_watch();
    // Re-armed on every active connection; a cancelled episode stays
    // disarmed so it issues no further attempts.
    let mut armed = true;

    loop {
        let snapshot = status.borrow_and_update().clone();
        if snapshot.active {
            armed = true;
        }
        if armed && snapshot.unexpected_close && !snapshot.active {
            armed = false;

            let episode = root.child_token();
            if let Ok(mut slot) = episode_slot.lock() {
                *slot = episode.clone();
            }
            episode_loop(&client, &policy, &episode, &status_tx).await;
            status_tx.send_replace(ReconnectStatus::Idle);
            continue;
        }

        tokio::select! {
            _ = root.cancelled() => return,
            changed = status.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

/// One retry episode: attempt, sleep, double, until success or
/// cancellation.
async fn episode_loop(
    client: &Arc<MillClient>,
    policy: &ReconnectPolicy,
    episode: &CancellationToken,
    status_tx: &watch::Sender<ReconnectStatus>,
) {
    info!(name = %client.name(), "starting reconnection episode");
    let mut backoff = Backoff::new(policy.base_delay);

    loop {
        if client.is_connection_active() {
            // Someone else reconnected.
            return;
        }
        status_tx.send_replace(ReconnectStatus::Trying {
            try_count: backoff.try_count(),
            next_delay: backoff.next_delay(),
        });

        // The in-flight attempt always finishes, even if the episode
        // is cancelled meanwhile.
        match client.connect().await {
            Ok(()) => {
                info!(
                    name = %client.name(),
                    "reconnected after {} attempt(s)",
                    backoff.try_count()
                );
                return;
            }
            Err(e) => {
                debug!(name = %client.name(), "reconnect attempt failed: {e}");
            }
        }

        let delay = backoff.advance();
        tokio::select! {
            _ = episode.cancelled() => {
                warn!(name = %client.name(), "reconnection episode cancelled");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
