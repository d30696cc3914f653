//! # millctl-core
//!
//! Core connection library for remote mill control through a bounce
//! server.
//!
//! This crate contains:
//! - **Wire**: single-byte command codec (`ControlCommand`, `Axis`)
//! - **Network**: `MillClient` with proxy tunneling and the relay
//!   channel handshake, built from pluggable `ConnectionStage`s
//! - **State**: `LinkPhase` state machine and shared `ClientState`
//! - **Monitor**: `LivenessMonitor` ping/pong reachability signal
//! - **Reconnect**: `ReconnectSupervisor` with exponential backoff
//! - **Channels**: `ControlClient` (commands) and `VideoClient`
//!   (raw frame stream with a bitrate gauge)
//! - **Error**: `MillError` — typed, `thiserror`-based error hierarchy

pub mod control;
pub mod error;
pub mod monitor;
pub mod net;
pub mod reconnect;
pub mod state;
pub mod video;
pub mod wire;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use control::{ControlClient, MillAxisState};
pub use error::MillError;
pub use monitor::{DEFAULT_PING_INTERVAL, LivenessMonitor, MonitorHandle};
pub use net::client::{ClientOptions, MillClient};
pub use net::{ConnectionStage, StageContext, StageProgress};
pub use reconnect::{Backoff, ReconnectPolicy, ReconnectStatus, ReconnectSupervisor};
pub use state::{ClientState, LinkPhase, LinkStatus};
pub use video::VideoClient;
pub use wire::{Axis, ControlCommand, JogDirection, CONTROL_CHANNEL, SPEED_RANGE, VIDEO_CHANNEL};
