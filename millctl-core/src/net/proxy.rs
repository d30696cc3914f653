//! HTTP CONNECT tunnel negotiation stage.
//!
//! Active only when proxy mode is enabled. On transport-up it issues a
//! `CONNECT` request for `localhost:<internal_port>` with a keep-alive
//! directive, then inspects the first inbound text response. The
//! tunnel counts as established iff the response contains the literal
//! word `Established` (case-sensitive); anything else fails the
//! connect attempt before the relay handshake ever runs.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::error::MillError;
use crate::net::{ConnectionStage, StageContext, StageProgress};
use crate::state::LinkPhase;

/// Substring the proxy must echo back for the tunnel to count.
const ESTABLISHED_TOKEN: &str = "Established";

/// Negotiates the CONNECT tunnel through an HTTP proxy.
pub struct ProxyStage {
    /// Port named in the CONNECT request line. Defaults to the relay
    /// port but is settable independently.
    internal_port: u16,
    /// Port named in the `Host:` header.
    relay_port: u16,
}

impl ProxyStage {
    pub fn new(internal_port: u16, relay_port: u16) -> Self {
        Self {
            internal_port,
            relay_port,
        }
    }

    fn connect_request(&self) -> String {
        format!(
            "CONNECT localhost:{} HTTP/1.1\r\nHost: localhost:{}\r\nProxy-Connection: Keep-Alive\r\n\r\n",
            self.internal_port, self.relay_port
        )
    }
}

#[async_trait]
impl ConnectionStage for ProxyStage {
    fn name(&self) -> &'static str {
        "proxy tunnel"
    }

    fn enter_phase(&self, phase: &mut LinkPhase) -> Result<(), MillError> {
        phase.begin_proxy()
    }

    async fn on_link_up(&mut self, ctx: &StageContext) -> Result<(), MillError> {
        debug!("sending CONNECT for localhost:{}", self.internal_port);
        ctx.write(Bytes::from(self.connect_request())).await
    }

    async fn on_bytes(
        &mut self,
        mut chunk: BytesMut,
        ctx: &StageContext,
    ) -> Result<StageProgress, MillError> {
        // The relay descriptor may coalesce into the same read as the
        // proxy response; everything past the header terminator
        // belongs to the next stage.
        let rest = match chunk.windows(4).position(|w| w == b"\r\n\r\n") {
            Some(pos) => chunk.split_off(pos + 4),
            None => BytesMut::new(),
        };

        let response = String::from_utf8_lossy(&chunk);
        if response.contains(ESTABLISHED_TOKEN) {
            debug!("proxy tunnel established");
            ctx.state().set_proxy_established();
            Ok(StageProgress::Complete(rest))
        } else {
            Err(MillError::ProxyNegotiationFailed(format!(
                "proxy response lacks establishment confirmation: {:?}",
                response.lines().next().unwrap_or_default()
            )))
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
