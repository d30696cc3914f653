//! Bounce-server channel handshake stage.
//!
//! The relay's first inbound message is a UTF-8 descriptor of the form
//! `<N>-<rest>`, where `<N>` is the decimal width (in hex digits) the
//! relay expects for the channel identifier. The client answers with
//! the optional auth token, verbatim, then the channel id left-padded
//! as exactly `N` lowercase hex digits. Only after that is the logical
//! connection considered up. The stage runs exactly once per connect
//! attempt; later bytes bypass it.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::error::MillError;
use crate::net::{ConnectionStage, StageContext, StageProgress};
use crate::state::LinkPhase;

/// Upper bound on the hex width a descriptor may demand. Anything
/// larger is treated as a corrupt descriptor.
const MAX_CHANNEL_WIDTH: usize = 16;

/// Negotiates the relay channel: auth token + padded channel id.
pub struct RelayStage {
    auth_token: Option<String>,
    channel: Option<u32>,
}

impl RelayStage {
    pub fn new(auth_token: Option<String>, channel: Option<u32>) -> Self {
        Self {
            auth_token,
            channel,
        }
    }

    /// Parse `<N>-<rest>` into the hex width.
    fn parse_descriptor(text: &str) -> Result<usize, MillError> {
        let (width_str, _rest) = text.split_once('-').ok_or_else(|| {
            MillError::RelayHandshakeFailed(format!(
                "descriptor missing separator: {text:?}"
            ))
        })?;
        let width: usize = width_str.parse().map_err(|_| {
            MillError::RelayHandshakeFailed(format!(
                "descriptor prefix is not numeric: {width_str:?}"
            ))
        })?;
        if width == 0 || width > MAX_CHANNEL_WIDTH {
            return Err(MillError::RelayHandshakeFailed(format!(
                "descriptor width {width} out of range"
            )));
        }
        Ok(width)
    }

    /// Format the channel id as exactly `width` lowercase hex digits.
    fn format_channel(channel: u32, width: usize) -> Result<String, MillError> {
        let formatted = format!("{channel:0width$x}");
        if formatted.len() > width {
            return Err(MillError::RelayHandshakeFailed(format!(
                "channel id {channel:#x} does not fit in {width} hex digits"
            )));
        }
        Ok(formatted)
    }
}

#[async_trait]
impl ConnectionStage for RelayStage {
    fn name(&self) -> &'static str {
        "relay handshake"
    }

    fn enter_phase(&self, phase: &mut LinkPhase) -> Result<(), MillError> {
        phase.begin_handshake()
    }

    async fn on_bytes(
        &mut self,
        chunk: BytesMut,
        ctx: &StageContext,
    ) -> Result<StageProgress, MillError> {
        let text = std::str::from_utf8(&chunk).map_err(|_| {
            MillError::RelayHandshakeFailed("descriptor is not valid UTF-8".into())
        })?;
        let width = Self::parse_descriptor(text)?;
        debug!("relay descriptor requests {width}-digit channel id");

        if let Some(auth) = &self.auth_token {
            ctx.write(Bytes::from(auth.clone())).await?;
        }
        if let Some(channel) = self.channel {
            let reply = Self::format_channel(channel, width)?;
            ctx.write(Bytes::from(reply)).await?;
        }

        Ok(StageProgress::Complete(BytesMut::new()))
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ClientState;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn test_ctx() -> (StageContext, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(8);
        let state = Arc::new(ClientState::new(false));
        (StageContext::new(tx, state), rx)
    }

    #[tokio::test]
    async fn replies_with_auth_then_padded_hex() {
        let (ctx, mut rx) = test_ctx();
        let mut stage = RelayStage::new(Some("hi".into()), Some(0));

        let progress = stage
            .on_bytes(BytesMut::from(&b"4-ignored"[..]), &ctx)
            .await
            .unwrap();
        assert!(matches!(progress, StageProgress::Complete(_)));

        assert_eq!(&rx.recv().await.unwrap()[..], b"hi");
        assert_eq!(&rx.recv().await.unwrap()[..], b"0000");
    }

    #[tokio::test]
    async fn padding_is_lowercase_and_exact_for_all_widths() {
        for width in 1..=8usize {
            let (ctx, mut rx) = test_ctx();
            let mut stage = RelayStage::new(None, Some(0xA));

            let descriptor = format!("{width}-server/1.0");
            stage
                .on_bytes(BytesMut::from(descriptor.as_bytes()), &ctx)
                .await
                .unwrap();

            let reply = rx.recv().await.unwrap();
            let reply = String::from_utf8(reply.to_vec()).unwrap();
            assert_eq!(reply.len(), width, "width {width}");
            assert!(reply.ends_with('a'));
            assert!(reply[..width - 1].chars().all(|c| c == '0'));
        }
    }

    #[tokio::test]
    async fn no_channel_configured_sends_auth_only() {
        let (ctx, mut rx) = test_ctx();
        let mut stage = RelayStage::new(Some("hi".into()), None);

        stage
            .on_bytes(BytesMut::from(&b"2-x"[..]), &ctx)
            .await
            .unwrap();
        assert_eq!(&rx.recv().await.unwrap()[..], b"hi");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_separator_fails() {
        let (ctx, _rx) = test_ctx();
        let mut stage = RelayStage::new(None, Some(0));
        let err = stage
            .on_bytes(BytesMut::from(&b"4ignored"[..]), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, MillError::RelayHandshakeFailed(_)));
    }

    #[tokio::test]
    async fn non_numeric_prefix_fails() {
        let (ctx, _rx) = test_ctx();
        let mut stage = RelayStage::new(None, Some(0));
        assert!(
            stage
                .on_bytes(BytesMut::from(&b"x-ignored"[..]), &ctx)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn channel_wider_than_descriptor_fails() {
        let (ctx, _rx) = test_ctx();
        let mut stage = RelayStage::new(None, Some(0x1FF));
        assert!(
            stage
                .on_bytes(BytesMut::from(&b"2-x"[..]), &ctx)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn zero_width_fails() {
        let (ctx, _rx) = test_ctx();
        let mut stage = RelayStage::new(None, Some(0));
        assert!(
            stage
                .on_bytes(BytesMut::from(&b"0-x"[..]), &ctx)
                .await
                .is_err()
        );
    }
}
