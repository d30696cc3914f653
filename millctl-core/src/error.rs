//! Domain-specific error types for the mill connection layer.
//!
//! All fallible operations return `Result<T, MillError>`.
//! No panics on invalid input — every error is typed and recoverable.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the mill connection layer.
#[derive(Debug, Error)]
pub enum MillError {
    // ── Transport Errors ─────────────────────────────────────────
    /// The TCP/TLS layer reported an error (DNS, refused, reset).
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Negotiation Errors ───────────────────────────────────────
    /// The HTTP CONNECT tunnel was not confirmed by the proxy.
    #[error("failed to initiate proxy: {0}")]
    ProxyNegotiationFailed(String),

    /// The bounce-server channel handshake could not be completed.
    #[error("failed to negotiate with relay: {0}")]
    RelayHandshakeFailed(String),

    // ── Usage Errors ─────────────────────────────────────────────
    /// A write was attempted while the connection is not ready.
    #[error("connection is not active")]
    NotConnected,

    /// A lifecycle operation was called in the wrong phase.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A command argument is outside its accepted range.
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

// ── Convenient From implementations ──────────────────────────────

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for MillError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        MillError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = MillError::NotConnected;
        assert!(e.to_string().contains("not active"));

        let e = MillError::RelayHandshakeFailed("missing separator".into());
        assert!(e.to_string().contains("negotiate with relay"));

        let e = MillError::ProxyNegotiationFailed("no confirmation".into());
        assert!(e.to_string().contains("proxy"));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let e: MillError = io_err.into();
        assert!(matches!(e, MillError::Transport(_)));
    }
}
