//! Control-channel client: mill commands plus liveness.
//!
//! Wraps a [`MillClient`] bound to the control channel. Outbound, it
//! encodes single-byte commands (stop, jog, speed, axis select);
//! inbound, it decodes the ping traffic that drives the liveness
//! monitor and answers the peer's own pings. After an unexpected
//! disconnect is repaired, the last commanded speed is replayed so the
//! mill does not silently fall back to its power-on default.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::MillError;
use crate::monitor::{DEFAULT_PING_INTERVAL, LivenessMonitor, MonitorHandle};
use crate::net::client::{ClientOptions, MillClient};
use crate::state::LinkStatus;
use crate::wire::{self, Axis, ControlCommand, JogDirection};

// ── MillAxisState ────────────────────────────────────────────────

/// Last commanded settings, as far as this client knows.
///
/// The mill keeps its own authoritative copy; this mirror exists so a
/// repaired connection can re-issue the speed and so a UI can display
/// what was last requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MillAxisState {
    pub axis: Option<Axis>,
    pub speed: Option<u8>,
    pub last_jog: Option<JogDirection>,
}

// ── ControlClient ────────────────────────────────────────────────

/// Client for the mill control channel.
pub struct ControlClient {
    client: Arc<MillClient>,
    monitor: LivenessMonitor,
    mill_state: Arc<Mutex<MillAxisState>>,
    pump: JoinHandle<()>,
    restore: JoinHandle<()>,
}

impl ControlClient {
    /// Build a control client for `host:port` with default settings:
    /// relay protocol on, control channel id, standard ping cadence.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let options = ClientOptions::new(host, port, Some(wire::CONTROL_CHANNEL))
            .with_name("control");
        Self::with_options(options, DEFAULT_PING_INTERVAL)
    }

    /// Build from explicit options. The channel id is forced to the
    /// control channel; everything else is taken as given.
    pub fn with_options(options: ClientOptions, ping_interval: Duration) -> Self {
        let options = options.with_channel(Some(wire::CONTROL_CHANNEL));
        let client = Arc::new(MillClient::new(options));
        let monitor = LivenessMonitor::spawn(Arc::clone(&client), ping_interval);
        let mill_state = Arc::new(Mutex::new(MillAxisState::default()));

        let pump = tokio::spawn(pump_inbound(
            Arc::clone(&client),
            monitor.shared_handle(),
        ));
        let restore = tokio::spawn(restore_after_reconnect(
            Arc::clone(&client),
            Arc::clone(&mill_state),
        ));

        Self {
            client,
            monitor,
            mill_state,
            pump,
            restore,
        }
    }

    /// Underlying connection handle, e.g. for a reconnect supervisor.
    pub fn connection(&self) -> Arc<MillClient> {
        Arc::clone(&self.client)
    }

    pub async fn connect(&self) -> Result<(), MillError> {
        self.client.connect().await
    }

    /// Orderly shutdown: stop pinging first, then tear the transport
    /// down so the close is recorded as requested.
    pub async fn disconnect(&self) -> Result<(), MillError> {
        self.monitor.halt();
        self.client.disconnect().await
    }

    pub fn is_connection_ready(&self) -> bool {
        self.client.is_connection_ready()
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Halt the mill immediately.
    pub async fn stop_mill(&self) -> Result<(), MillError> {
        self.send(ControlCommand::Stop).await
    }

    /// Move the selected axis one step. Any positive `direction`
    /// means forward, any negative means back; zero is rejected.
    pub async fn jog_mill(&self, direction: i32) -> Result<(), MillError> {
        let dir = JogDirection::from_signum(direction).ok_or_else(|| {
            MillError::InvalidCommand("jog direction must be non-zero".into())
        })?;
        self.send(ControlCommand::Jog(dir)).await?;
        if let Ok(mut s) = self.mill_state.lock() {
            s.last_jog = Some(dir);
        }
        Ok(())
    }

    /// Set the feed speed level (1..=24).
    pub async fn set_speed(&self, speed: u8) -> Result<(), MillError> {
        self.send(ControlCommand::Speed(speed)).await?;
        if let Ok(mut s) = self.mill_state.lock() {
            s.speed = Some(speed);
        }
        Ok(())
    }

    /// Select the axis that subsequent jogs act on.
    pub async fn set_axis(&self, axis: Axis) -> Result<(), MillError> {
        self.send(ControlCommand::SelectAxis(axis)).await?;
        if let Ok(mut s) = self.mill_state.lock() {
            s.axis = Some(axis);
        }
        Ok(())
    }

    async fn send(&self, command: ControlCommand) -> Result<(), MillError> {
        let bytes = command.encode()?;
        trace!(?command, "sending control command");
        self.client.write(bytes).await
    }

    /// Last commanded settings.
    pub fn mill_state(&self) -> MillAxisState {
        self.mill_state
            .lock()
            .map(|s| *s)
            .unwrap_or_default()
    }

    // ── Liveness ─────────────────────────────────────────────────

    /// Whether the mill answered the most recent ping.
    pub fn is_mill_accessible(&self) -> bool {
        self.monitor.is_peer_reachable()
    }

    /// Subscribe to mill reachability transitions.
    pub fn subscribe_accessibility(&self) -> watch::Receiver<bool> {
        self.monitor.subscribe()
    }

    /// Block until the next reachability transition or the timeout;
    /// returns whether a transition was observed in time.
    pub async fn await_accessibility_change(&self, timeout: Duration) -> bool {
        self.monitor.wait_for_change(timeout).await
    }

    /// Subscribe to connection status snapshots.
    pub fn status_watch(&self) -> watch::Receiver<LinkStatus> {
        self.client.status_watch()
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        self.pump.abort();
        self.restore.abort();
    }
}

// ── Background tasks ─────────────────────────────────────────────

/// Decode inbound control-channel bytes.
///
/// The channel carries only ping traffic toward the client. A ping
/// request is answered immediately regardless of monitor state; a
/// ping response clears the monitor's outstanding flag. Anything else
/// is logged and skipped.
async fn pump_inbound(client: Arc<MillClient>, monitor: MonitorHandle) {
    let Some(mut inbound) = client.take_inbound() else {
        warn!(name = %client.name(), "inbound stream already claimed");
        return;
    };

    while let Some(chunk) = inbound.recv().await {
        for &byte in chunk.iter() {
            match byte {
                wire::PING_REQUEST => {
                    trace!(name = %client.name(), "ping request from peer");
                    if client.write_byte(wire::PING_RESPONSE).await.is_err() {
                        // Connection racing down; the dispatch task
                        // reports it.
                        return;
                    }
                }
                wire::PING_RESPONSE => {
                    trace!(name = %client.name(), "ping response from peer");
                    monitor.on_ping_response();
                }
                other => {
                    debug!(name = %client.name(), "unknown inbound byte: {other:#04x}");
                }
            }
        }
    }
}

/// Replay the last commanded speed once an unexpected close has been
/// repaired. The axis selection is deliberately not replayed: an
/// operator must re-confirm the axis before jogging resumes.
async fn restore_after_reconnect(
    client: Arc<MillClient>,
    mill_state: Arc<Mutex<MillAxisState>>,
) {
    let mut status = client.status_watch();
    let mut seen_losses = status.borrow_and_update().unexpected_closes;

    loop {
        let snapshot = status.borrow_and_update().clone();
        // The loss counter is monotonic, so this fires even when the
        // down and up snapshots coalesce in the watch channel.
        if snapshot.active && snapshot.unexpected_closes > seen_losses {
            seen_losses = snapshot.unexpected_closes;
            let speed = mill_state.lock().ok().and_then(|s| s.speed);
            if let Some(speed) = speed {
                debug!(name = %client.name(), "restoring speed {speed} after reconnect");
                if let Ok(bytes) = ControlCommand::Speed(speed).encode() {
                    if let Err(e) = client.write(bytes).await {
                        warn!(name = %client.name(), "speed restore failed: {e}");
                    }
                }
            }
        }
        if status.changed().await.is_err() {
            return;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn jog_rejects_zero_direction() {
        let client = ControlClient::new("127.0.0.1", 1);
        let err = client.jog_mill(0).await.unwrap_err();
        assert!(matches!(err, MillError::InvalidCommand(_)));
    }

    #[tokio::test]
    async fn commands_require_ready_connection() {
        let client = ControlClient::new("127.0.0.1", 1);
        let err = client.stop_mill().await.unwrap_err();
        assert!(matches!(err, MillError::NotConnected));
    }

    #[tokio::test]
    async fn mill_state_tracks_nothing_until_commanded() {
        let client = ControlClient::new("127.0.0.1", 1);
        assert_eq!(client.mill_state(), MillAxisState::default());
    }
}
