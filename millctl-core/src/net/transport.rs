//! Asynchronous byte-stream transport to a relay endpoint.
//!
//! Opens a TCP connection (optionally wrapped in TLS), then drives it
//! with background reader and writer tasks bridged to the owner by
//! mpsc channels. The relay protocol is a raw stream, so the codec is
//! [`BytesCodec`] — chunks arrive in order with no framing of their
//! own. Each outbound chunk is flushed immediately.
//!
//! `open` returns once the raw socket (and TLS handshake, if enabled)
//! exists; logical negotiation happens in later stages.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_util::codec::{BytesCodec, Framed};
use tracing::debug;

use crate::error::MillError;

// ── IoStream ─────────────────────────────────────────────────────

/// Unified stream type: plain TCP or TLS-wrapped TCP.
pub enum IoStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

// ── Transport ────────────────────────────────────────────────────

/// Channel capacity between the owner and the I/O tasks. Bounded so a
/// stalled consumer exerts back pressure on the network read loop
/// instead of dropping bytes.
const CHANNEL_CAPACITY: usize = 256;

pub type TransportSender = mpsc::Sender<Bytes>;

/// A live byte-stream connection driven by background I/O tasks.
pub struct Transport {
    /// Outbound chunks to the background writer task.
    tx: mpsc::Sender<Bytes>,
    /// Inbound chunks from the background reader task. Yields `None`
    /// when the transport goes down.
    rx: mpsc::Receiver<BytesMut>,
}

impl Transport {
    /// Open a connection to `host:port`, wrapping it in TLS when
    /// `use_tls` is set. DNS resolution happens here and may block
    /// briefly.
    pub async fn open(host: &str, port: u16, use_tls: bool) -> Result<Self, MillError> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;

        let stream = if use_tls {
            let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
                MillError::Transport(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("invalid TLS server name {host}: {e}"),
                ))
            })?;
            let tls = tls_connector().connect(server_name, stream).await?;
            IoStream::Tls(Box::new(tls))
        } else {
            IoStream::Plain(stream)
        };

        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-connected stream. Used directly by tests.
    pub fn from_stream(stream: IoStream) -> Self {
        let (mut net_writer, mut net_reader) = Framed::new(stream, BytesCodec::new()).split();

        // Owner -> Network
        let (user_tx, mut network_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);

        // Network -> Owner
        let (network_tx, user_rx) = mpsc::channel::<BytesMut>(CHANNEL_CAPACITY);

        // Writer task: each chunk is sent and flushed immediately.
        tokio::spawn(async move {
            while let Some(chunk) = network_rx.recv().await {
                if let Err(e) = net_writer.send(chunk).await {
                    debug!("transport write error: {e}");
                    break;
                }
            }
            // All senders dropped or write failed: shut the socket down.
            let _ = net_writer.close().await;
        });

        // Reader task: deliver chunks in arrival order. Awaiting the
        // bounded send blocks the read loop when the owner lags, so
        // nothing is silently dropped.
        tokio::spawn(async move {
            while let Some(result) = net_reader.next().await {
                match result {
                    Ok(chunk) => {
                        if network_tx.send(chunk).await.is_err() {
                            // Owner dropped its receiver: stop reading.
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("transport read error: {e}");
                        break;
                    }
                }
            }
            // network_tx drops here; the owner observes `None`.
        });

        Self {
            tx: user_tx,
            rx: user_rx,
        }
    }

    /// Receive the next inbound chunk; `None` means transport down.
    pub async fn recv(&mut self) -> Option<BytesMut> {
        self.rx.recv().await
    }

    /// Split into the raw sender and receiver halves.
    pub fn into_parts(self) -> (mpsc::Sender<Bytes>, mpsc::Receiver<BytesMut>) {
        (self.tx, self.rx)
    }
}

fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

// ── Tests ────────────────────────────────────────────────────────
