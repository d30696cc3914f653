//! The connection core: coordinates transport, negotiation stages,
//! and the application byte stream for one relay channel.
//!
//! `connect()` is asynchronous and resolves only once every enabled
//! stage (proxy tunnel, relay handshake) has succeeded, or with the
//! specific failure. Disconnection is two-phase: the close request is
//! cheap, and awaiting `disconnect()` gives a fully quiesced shutdown.
//! All shared flags live in [`ClientState`] and are safe to read from
//! any thread; status transitions are observable via `status_watch()`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::MillError;
use crate::net::proxy::ProxyStage;
use crate::net::relay::RelayStage;
use crate::net::transport::{Transport, TransportSender};
use crate::net::{ConnectionStage, StageContext, StageProgress};
use crate::state::{ClientState, LinkPhase, LinkStatus};

/// Capacity of the application inbound queue. Bounded: a slow
/// consumer back-pressures the dispatch loop rather than losing bytes.
const INBOUND_CAPACITY: usize = 256;

// ── ClientOptions ────────────────────────────────────────────────

/// Construction-time parameters of a relay connection.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Relay host name or address.
    pub host: String,
    /// Relay port.
    pub port: u16,
    /// Port named in the proxy CONNECT request line. `None` means
    /// the relay port.
    pub internal_port: Option<u16>,
    /// Wrap the TCP stream in TLS.
    pub use_tls: bool,
    /// Negotiate an HTTP CONNECT tunnel before anything else.
    pub proxy_enabled: bool,
    /// Run the bounce-server handshake. Disabling this makes the
    /// connection active as soon as the transport (and proxy) is up.
    pub relay_protocol: bool,
    /// Auth token written verbatim during the handshake.
    pub auth_token: Option<String>,
    /// Logical channel id on the relay; `None` sends no channel reply.
    pub channel: Option<u32>,
    /// Display name used in log events.
    pub name: String,
    /// Overall deadline covering proxy + relay negotiation.
    pub connect_timeout: Duration,
}

impl ClientOptions {
    pub fn new(host: impl Into<String>, port: u16, channel: Option<u32>) -> Self {
        Self {
            host: host.into(),
            port,
            internal_port: None,
            use_tls: false,
            proxy_enabled: false,
            relay_protocol: true,
            auth_token: Some("hi".to_string()),
            channel,
            name: "client".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn with_proxy(mut self, proxy_enabled: bool) -> Self {
        self.proxy_enabled = proxy_enabled;
        self
    }

    pub fn with_internal_port(mut self, port: u16) -> Self {
        self.internal_port = Some(port);
        self
    }

    pub fn with_relay_protocol(mut self, enabled: bool) -> Self {
        self.relay_protocol = enabled;
        self
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    pub fn with_channel(mut self, channel: Option<u32>) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

// ── MillClient ───────────────────────────────────────────────────

/// Handles owned per live connection.
struct Live {
    raw_tx: TransportSender,
    closing: CancellationToken,
    closed_rx: watch::Receiver<bool>,
}

/// A managed connection to one relay channel.
///
/// Owns the transport exclusively; collaborators hold the client in
/// an `Arc` and interact through the async API and the status watch.
pub struct MillClient {
    options: ClientOptions,
    state: Arc<ClientState>,
    phase: Arc<Mutex<LinkPhase>>,
    live: Mutex<Option<Live>>,
    /// Serializes connect attempts (manual + reconnect supervisor).
    connect_gate: tokio::sync::Mutex<()>,
    inbound_tx: mpsc::Sender<Bytes>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
}

impl MillClient {
    pub fn new(options: ClientOptions) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let state = Arc::new(ClientState::new(options.proxy_enabled));
        Self {
            options,
            state,
            phase: Arc::new(Mutex::new(LinkPhase::Disconnected)),
            live: Mutex::new(None),
            connect_gate: tokio::sync::Mutex::new(()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn is_connection_active(&self) -> bool {
        self.state.is_active()
    }

    /// Active AND (proxy disabled OR proxy established). Use this,
    /// not `is_connection_active`, before writing.
    pub fn is_connection_ready(&self) -> bool {
        self.state.is_ready()
    }

    pub fn is_unexpected_close(&self) -> bool {
        self.state.is_unexpected_close()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.state.close_reason()
    }

    pub fn state(&self) -> &Arc<ClientState> {
        &self.state
    }

    /// Subscribe to status snapshots (active / ready / close info).
    pub fn status_watch(&self) -> watch::Receiver<LinkStatus> {
        self.state.subscribe()
    }

    /// Current lifecycle phase (snapshot).
    pub fn phase(&self) -> LinkPhase {
        self.phase.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Take the inbound application byte stream. Yields every chunk
    /// that arrives after negotiation, order-preserved. Can be taken
    /// once; the stream survives reconnections.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.inbound_rx.lock().ok().and_then(|mut g| g.take())
    }

    // ── Connect ──────────────────────────────────────────────────

    /// Establish the connection: transport, then every enabled
    /// negotiation stage in order. Resolves once the connection is
    /// active, or with the first failure; either way `attempted`
    /// becomes true before this returns.
    pub async fn connect(&self) -> Result<(), MillError> {
        let _gate = self.connect_gate.lock().await;

        if self.state.is_active() {
            return Err(MillError::InvalidState("already connected"));
        }
        // Drop any stale handles from a previous (dead) connection.
        if let Ok(mut live) = self.live.lock() {
            live.take();
        }
        if let Ok(mut phase) = self.phase.lock() {
            phase.begin_connect()?;
        }
        self.state.reset_for_connect(self.options.proxy_enabled);
        info!(
            name = %self.options.name,
            host = %self.options.host,
            port = self.options.port,
            tls = self.options.use_tls,
            proxy = self.options.proxy_enabled,
            "connecting"
        );

        match self.establish().await {
            Ok((raw_tx, rx, leftover)) => {
                if let Ok(mut phase) = self.phase.lock() {
                    phase.activate()?;
                }
                self.state.set_active();

                let closing = CancellationToken::new();
                let (closed_tx, closed_rx) = watch::channel(false);
                if let Ok(mut live) = self.live.lock() {
                    *live = Some(Live {
                        raw_tx: raw_tx.clone(),
                        closing: closing.clone(),
                        closed_rx,
                    });
                }

                let inbound_tx = self.inbound_tx.clone();
                let state = Arc::clone(&self.state);
                let phase = Arc::clone(&self.phase);
                let name = self.options.name.clone();
                tokio::spawn(dispatch(
                    rx, leftover, inbound_tx, state, phase, closing, closed_tx, name,
                ));

                info!(name = %self.options.name, "connection active");
                Ok(())
            }
            Err(e) => {
                if let Ok(mut phase) = self.phase.lock() {
                    phase.force_disconnect();
                }
                let reason = e.to_string();
                self.state.fail_connect(&reason);
                warn!(name = %self.options.name, "connect failed: {reason}");
                Err(e)
            }
        }
    }

    /// Open the transport and drive the stage pipeline to completion.
    async fn establish(
        &self,
    ) -> Result<(TransportSender, mpsc::Receiver<BytesMut>, BytesMut), MillError> {
        let opts = &self.options;
        let started = Instant::now();
        let transport = tokio::time::timeout(
            opts.connect_timeout,
            Transport::open(&opts.host, opts.port, opts.use_tls),
        )
        .await
        .map_err(|_| MillError::Timeout(opts.connect_timeout))??;
        let (raw_tx, mut rx) = transport.into_parts();
        let ctx = StageContext::new(raw_tx.clone(), Arc::clone(&self.state));

        let mut stages: Vec<Box<dyn ConnectionStage>> = Vec::new();
        if opts.proxy_enabled {
            stages.push(Box::new(ProxyStage::new(
                opts.internal_port.unwrap_or(opts.port),
                opts.port,
            )));
        }
        if opts.relay_protocol {
            stages.push(Box::new(RelayStage::new(
                opts.auth_token.clone(),
                opts.channel,
            )));
        }

        let mut leftover = BytesMut::new();
        for stage in &mut stages {
            if let Ok(mut phase) = self.phase.lock() {
                stage.enter_phase(&mut phase)?;
            }
            debug!(name = %opts.name, stage = stage.name(), "negotiating");
            stage.on_link_up(&ctx).await?;

            loop {
                let chunk = if leftover.is_empty() {
                    let remaining = opts
                        .connect_timeout
                        .checked_sub(started.elapsed())
                        .unwrap_or(Duration::ZERO);
                    match tokio::time::timeout(remaining, rx.recv()).await {
                        Ok(Some(chunk)) => chunk,
                        Ok(None) => return Err(stage_failure(stage.as_ref(), "connection closed")),
                        Err(_) => return Err(stage_failure(stage.as_ref(), "timed out")),
                    }
                } else {
                    std::mem::take(&mut leftover)
                };

                match stage.on_bytes(chunk, &ctx).await? {
                    StageProgress::Pending => continue,
                    StageProgress::Complete(rest) => {
                        leftover = rest;
                        break;
                    }
                }
            }
        }

        Ok((raw_tx, rx, leftover))
    }

    // ── Disconnect ───────────────────────────────────────────────

    /// Request close and await full teardown.
    ///
    /// Cancels the dispatch loop (which marks the close expected)
    /// before the transport is torn down, then blocks until the
    /// connection has fully quiesced. Contends on the connect gate,
    /// so a disconnect issued during an in-flight connect attempt
    /// waits for that attempt to resolve and then tears it down.
    /// Idempotent.
    pub async fn disconnect(&self) -> Result<(), MillError> {
        let _gate = self.connect_gate.lock().await;

        let live = match self.live.lock() {
            Ok(mut g) => g.take(),
            Err(_) => None,
        };
        let Some(live) = live else {
            return Ok(());
        };

        if let Ok(mut phase) = self.phase.lock() {
            if phase.begin_disconnect().is_err() {
                phase.force_disconnect();
            }
        }
        info!(name = %self.options.name, "disconnecting");

        live.closing.cancel();
        drop(live.raw_tx);

        let mut closed = live.closed_rx;
        while !*closed.borrow() {
            if closed.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }

    // ── Write path ───────────────────────────────────────────────

    /// Write application bytes, gated on readiness: rejected with
    /// `NotConnected` unless active and, when proxy mode is enabled,
    /// the tunnel is established. Flushed immediately.
    pub async fn write(&self, chunk: Bytes) -> Result<(), MillError> {
        if !self.state.is_ready() {
            return Err(MillError::NotConnected);
        }
        let tx = self
            .live
            .lock()
            .ok()
            .and_then(|g| g.as_ref().map(|l| l.raw_tx.clone()))
            .ok_or(MillError::NotConnected)?;
        tx.send(chunk).await?;
        Ok(())
    }

    /// Write a single tag byte.
    pub async fn write_byte(&self, byte: u8) -> Result<(), MillError> {
        self.write(Bytes::copy_from_slice(&[byte])).await
    }
}

/// Attribute a mid-negotiation failure to the stage that was running.
fn stage_failure(stage: &dyn ConnectionStage, what: &str) -> MillError {
    match stage.name() {
        "proxy tunnel" => MillError::ProxyNegotiationFailed(what.to_string()),
        _ => MillError::RelayHandshakeFailed(what.to_string()),
    }
}

// ── Dispatch loop ────────────────────────────────────────────────

/// Post-negotiation inbound pump: forwards every chunk to the
/// application queue, detects transport loss, and records whether the
/// close was requested or unexpected.
#[allow(clippy::too_many_arguments)]
async fn dispatch(
    mut rx: mpsc::Receiver<BytesMut>,
    leftover: BytesMut,
    inbound_tx: mpsc::Sender<Bytes>,
    state: Arc<ClientState>,
    phase: Arc<Mutex<LinkPhase>>,
    closing: CancellationToken,
    closed_tx: watch::Sender<bool>,
    name: String,
) {
    if !leftover.is_empty() {
        let _ = inbound_tx.send(leftover.freeze()).await;
    }

    loop {
        tokio::select! {
            biased;
            _ = closing.cancelled() => break,
            chunk = rx.recv() => match chunk {
                Some(chunk) => {
                    // Back-pressured: block here rather than drop.
                    if inbound_tx.send(chunk.freeze()).await.is_err() {
                        debug!(name = %name, "inbound consumer gone, stopping dispatch");
                        break;
                    }
                }
                None => break,
            },
        }
    }

    let expected = closing.is_cancelled();
    if let Ok(mut p) = phase.lock() {
        p.force_disconnect();
    }
    if expected {
        state.transport_down(true, "disconnect requested");
        debug!(name = %name, "transport closed after disconnect request");
    } else {
        state.transport_down(false, "unexpected disconnect from server");
        warn!(name = %name, "unexpected disconnect from server");
    }
    let _ = closed_tx.send(true);
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn write_rejected_before_connect() {
        let client = MillClient::new(ClientOptions::new("127.0.0.1", 1, Some(0)));
        let err = client.write_byte(0x65).await.unwrap_err();
        assert!(matches!(err, MillError::NotConnected));
    }

    #[tokio::test]
    async fn bare_transport_activates_without_stages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1];
            sock.read_exact(&mut buf).await.unwrap();
            buf[0]
        });

        let options = ClientOptions::new(addr.ip().to_string(), addr.port(), None)
            .with_relay_protocol(false);
        let client = MillClient::new(options);
        client.connect().await.unwrap();
        assert!(client.is_connection_active());
        assert!(client.is_connection_ready());
        assert!(client.phase().is_active());

        client.write_byte(0x42).await.unwrap();
        assert_eq!(server.await.unwrap(), 0x42);

        client.disconnect().await.unwrap();
        assert!(!client.is_connection_active());
        assert!(!client.is_unexpected_close());
    }

    #[tokio::test]
    async fn disconnect_during_connect_waits_for_the_attempt() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            // Stall the handshake so the connect attempt is still in
            // flight when the disconnect arrives.
            tokio::time::sleep(Duration::from_millis(200)).await;
            tokio::io::AsyncWriteExt::write_all(&mut sock, b"4-x")
                .await
                .unwrap();
            let mut buf = [0u8; 16];
            let _ = sock.read(&mut buf).await;
            sock
        });

        let options = ClientOptions::new(addr.ip().to_string(), addr.port(), Some(0));
        let client = Arc::new(MillClient::new(options));

        let connector = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Resolves only after the in-flight attempt finished, and the
        // connection must not be left active behind the caller's back.
        client.disconnect().await.unwrap();
        assert!(!client.is_connection_active());
        assert!(!client.is_unexpected_close());

        assert!(connector.await.unwrap().is_ok());
        let _sock = server.await.unwrap();
    }

    #[tokio::test]
    async fn inbound_stream_delivers_post_handshake_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            tokio::io::AsyncWriteExt::write_all(&mut sock, b"payload")
                .await
                .unwrap();
            sock
        });

        let options = ClientOptions::new(addr.ip().to_string(), addr.port(), None)
            .with_relay_protocol(false);
        let client = MillClient::new(options);

        let mut inbound = client.take_inbound().expect("inbound stream available");
        assert!(client.take_inbound().is_none(), "stream can be taken once");

        client.connect().await.unwrap();
        let _sock = server.await.unwrap();

        let mut collected = Vec::new();
        while collected.len() < 7 {
            let chunk = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
                .await
                .expect("timed out waiting for inbound bytes")
                .expect("inbound stream closed");
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(&collected, b"payload");

        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn double_connect_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let options = ClientOptions::new(addr.ip().to_string(), addr.port(), None)
            .with_relay_protocol(false);
        let client = MillClient::new(options);
        client.connect().await.unwrap();

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, MillError::InvalidState(_)));

        client.disconnect().await.unwrap();
    }
}
