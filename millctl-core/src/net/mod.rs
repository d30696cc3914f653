//! Network layer: byte transport, negotiation stages, and the client
//! that coordinates them.
//!
//! A connection is assembled by composition rather than inheritance:
//! the client runs an ordered list of [`ConnectionStage`]s (proxy
//! tunnel, relay handshake) over the raw transport, and only once
//! every stage has completed do inbound bytes flow to the application
//! layer. New channel types plug in without subclassing.

pub mod client;
pub mod proxy;
pub mod relay;
pub mod transport;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::error::MillError;
use crate::state::{ClientState, LinkPhase};
use transport::TransportSender;

// ── StageContext ─────────────────────────────────────────────────

/// What a negotiation stage may touch: the raw write path (bypassing
/// the ready gate, since negotiation happens before readiness) and
/// the shared state flags.
pub struct StageContext {
    raw_tx: TransportSender,
    state: Arc<ClientState>,
}

impl StageContext {
    pub fn new(raw_tx: TransportSender, state: Arc<ClientState>) -> Self {
        Self { raw_tx, state }
    }

    /// Write directly to the transport, skipping readiness checks.
    pub async fn write(&self, chunk: Bytes) -> Result<(), MillError> {
        self.raw_tx.send(chunk).await?;
        Ok(())
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }
}

// ── ConnectionStage ──────────────────────────────────────────────

/// Outcome of feeding bytes to a negotiation stage.
#[derive(Debug)]
pub enum StageProgress {
    /// The stage needs more bytes.
    Pending,
    /// The stage resolved; any unconsumed bytes carry over to the
    /// next stage (or the application layer).
    Complete(BytesMut),
}

/// One step of the connection setup pipeline.
///
/// Stages run in order; each sees the inbound stream only until it
/// resolves, after which bytes bypass it permanently.
#[async_trait]
pub trait ConnectionStage: Send {
    /// Short name used in logs and timeout reasons.
    fn name(&self) -> &'static str;

    /// Advance the lifecycle phase machine as this stage takes over
    /// the inbound stream.
    fn enter_phase(&self, _phase: &mut LinkPhase) -> Result<(), MillError> {
        Ok(())
    }

    /// Called once when the raw transport comes up and every earlier
    /// stage has completed.
    async fn on_link_up(&mut self, _ctx: &StageContext) -> Result<(), MillError> {
        Ok(())
    }

    /// Feed one inbound chunk to the stage.
    async fn on_bytes(
        &mut self,
        chunk: BytesMut,
        ctx: &StageContext,
    ) -> Result<StageProgress, MillError>;
}
