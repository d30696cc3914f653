//! Video-channel client: raw frame bytes and a bitrate gauge.
//!
//! The video channel carries an opaque byte stream (MJPEG from the
//! spindle camera) that is forwarded untouched to a consumer queue.
//! No command protocol and no pings run on this channel. A sampler
//! publishes the inbound bitrate once a second for UI display.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::MillError;
use crate::net::client::{ClientOptions, MillClient};
use crate::state::LinkStatus;
use crate::wire;

/// Consumer queue depth. A slow consumer back-pressures the socket
/// instead of losing frames.
const FRAME_QUEUE_CAPACITY: usize = 1024;

/// Bitrate sampling period.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Client for the video channel.
pub struct VideoClient {
    client: Arc<MillClient>,
    received: Arc<AtomicU64>,
    bitrate_rx: watch::Receiver<u64>,
    frames: std::sync::Mutex<Option<mpsc::Receiver<Bytes>>>,
    pump: JoinHandle<()>,
    sampler: JoinHandle<()>,
}

impl VideoClient {
    /// Build a video client for `host:port` with default settings.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let options = ClientOptions::new(host, port, Some(wire::VIDEO_CHANNEL))
            .with_name("video");
        Self::with_options(options)
    }

    /// Build from explicit options; the channel id is forced to the
    /// video channel.
    pub fn with_options(options: ClientOptions) -> Self {
        let options = options.with_channel(Some(wire::VIDEO_CHANNEL));
        let client = Arc::new(MillClient::new(options));
        let received = Arc::new(AtomicU64::new(0));
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        let (bitrate_tx, bitrate_rx) = watch::channel(0u64);

        let pump = tokio::spawn(pump_frames(
            Arc::clone(&client),
            Arc::clone(&received),
            frame_tx,
        ));
        let sampler = tokio::spawn(sample_bitrate(Arc::clone(&received), bitrate_tx));

        Self {
            client,
            received,
            bitrate_rx,
            frames: std::sync::Mutex::new(Some(frame_rx)),
            pump,
            sampler,
        }
    }

    /// Underlying connection handle, e.g. for a reconnect supervisor.
    pub fn connection(&self) -> Arc<MillClient> {
        Arc::clone(&self.client)
    }

    pub async fn connect(&self) -> Result<(), MillError> {
        self.client.connect().await
    }

    pub async fn disconnect(&self) -> Result<(), MillError> {
        self.client.disconnect().await
    }

    pub fn is_connection_ready(&self) -> bool {
        self.client.is_connection_ready()
    }

    pub fn status_watch(&self) -> watch::Receiver<LinkStatus> {
        self.client.status_watch()
    }

    /// Take the frame stream. Yields raw chunks in arrival order; can
    /// be taken once.
    pub fn take_frames(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.frames.lock().ok().and_then(|mut f| f.take())
    }

    /// Total bytes received over the lifetime of this client.
    pub fn bytes_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Most recent one-second bitrate sample, in bits per second.
    pub fn bitrate_bps(&self) -> u64 {
        *self.bitrate_rx.borrow()
    }

    /// Subscribe to bitrate samples.
    pub fn subscribe_bitrate(&self) -> watch::Receiver<u64> {
        self.bitrate_rx.clone()
    }
}

impl Drop for VideoClient {
    fn drop(&mut self) {
        self.pump.abort();
        self.sampler.abort();
    }
}

/// Forward inbound chunks to the consumer queue, counting bytes.
async fn pump_frames(
    client: Arc<MillClient>,
    received: Arc<AtomicU64>,
    frame_tx: mpsc::Sender<Bytes>,
) {
    let Some(mut inbound) = client.take_inbound() else {
        debug!(name = %client.name(), "inbound stream already claimed");
        return;
    };

    while let Some(chunk) = inbound.recv().await {
        received.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        if frame_tx.send(chunk).await.is_err() {
            // Consumer gone; keep counting is pointless.
            debug!(name = %client.name(), "frame consumer dropped");
            return;
        }
    }
}

/// Publish the delta of the byte counter once a second, as bits/s.
async fn sample_bitrate(received: Arc<AtomicU64>, bitrate_tx: watch::Sender<u64>) {
    let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last = received.load(Ordering::Relaxed);

    loop {
        ticker.tick().await;
        let now = received.load(Ordering::Relaxed);
        let delta = now.saturating_sub(last);
        last = now;
        if bitrate_tx.send(delta.saturating_mul(8)).is_err() {
            return;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
