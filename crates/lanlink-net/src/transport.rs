//! Framed TCP transport with liveness tracking.
//!
//! A [`FrameTransport`] owns one TCP connection and exchanges
//! newline-delimited JSON frames over it.  The read and write halves sit
//! behind independent async mutexes, so one task may send while another
//! receives; two tasks calling `send` (or `recv`) concurrently simply
//! serialize on the mutex.
//!
//! The transport also tracks when the peer last proved it was alive: the
//! session's Ping handler calls [`FrameTransport::update_last_ping`], and the
//! heartbeat loop polls [`FrameTransport::is_alive`] to detect a silent peer.
//!
//! Any I/O failure during send or receive forces an implicit
//! [`FrameTransport::disconnect`] before the error reaches the caller, so a
//! broken connection is never left half-open.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use lanlink_core::{decode_frame, encode_frame, Frame, ProtocolError};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Errors surfaced by transport send/receive.
#[derive(Debug, Error)]
pub enum TransportError {
    /// An I/O error on the underlying connection.
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection (EOF on the read side).
    #[error("connection closed by peer")]
    Closed,

    /// The received line was not a decodable frame.  The connection itself
    /// is still usable; the session receive loop drops the record and
    /// continues.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Timing knobs for liveness tracking and the heartbeat loop.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// How long since the last peer Ping before the peer counts as dead.
    pub liveness_timeout: Duration,
    /// How often the session's heartbeat loop sends a Ping.
    pub heartbeat_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            liveness_timeout: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(60),
        }
    }
}

/// One TCP connection carrying newline-delimited frames.
pub struct FrameTransport {
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    peer_addr: Option<SocketAddr>,
    last_ping: StdMutex<Instant>,
    disconnected: AtomicBool,
    config: TransportConfig,
}

impl FrameTransport {
    /// Wraps an established TCP stream.  The liveness clock starts now.
    pub fn new(stream: TcpStream, config: TransportConfig) -> Self {
        let peer_addr = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(write_half),
            peer_addr,
            last_ping: StdMutex::new(Instant::now()),
            disconnected: AtomicBool::new(false),
            config,
        }
    }

    /// The remote address, when it was known at construction time.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// The timing configuration this transport was built with.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// `true` until the liveness timeout elapses without a peer Ping.
    pub fn is_alive(&self) -> bool {
        let last = *self
            .last_ping
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        last.elapsed() <= self.config.liveness_timeout
    }

    /// Resets the liveness clock.  Called by the session's Ping handler.
    pub fn update_last_ping(&self) {
        let mut last = self
            .last_ping
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *last = Instant::now();
    }

    /// Writes one frame as a newline-terminated line and flushes.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] on encoding or I/O failure.  An I/O failure
    /// disconnects the transport before the error is returned.
    pub async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        let line = encode_frame(frame)?;

        let result = {
            let mut writer = self.writer.lock().await;
            write_line(&mut writer, &line).await
        };

        match result {
            Ok(()) => {
                debug!(peer = ?self.peer_addr, frame = %frame, "sent");
                Ok(())
            }
            Err(e) => {
                warn!(peer = ?self.peer_addr, error = %e, "send failed; disconnecting");
                self.disconnect().await;
                Err(e.into())
            }
        }
    }

    /// Reads exactly one line and decodes it.
    ///
    /// Returns `Ok(None)` for a benign blank line.  EOF is reported as
    /// [`TransportError::Closed`]; an undecodable line as
    /// [`TransportError::Protocol`] (the connection stays up).  I/O failures
    /// and EOF disconnect the transport before the error is returned.
    pub async fn recv(&self) -> Result<Option<Frame>, TransportError> {
        let mut line = String::new();
        let read = {
            let mut reader = self.reader.lock().await;
            reader.read_line(&mut line).await
        };

        match read {
            Ok(0) => {
                debug!(peer = ?self.peer_addr, "peer closed the connection");
                self.disconnect().await;
                Err(TransportError::Closed)
            }
            Ok(_) => {
                let line = line.trim();
                if line.is_empty() {
                    return Ok(None);
                }
                let frame = decode_frame(line)?;
                debug!(peer = ?self.peer_addr, frame = %frame, "received");
                Ok(Some(frame))
            }
            Err(e) => {
                warn!(peer = ?self.peer_addr, error = %e, "receive failed; disconnecting");
                self.disconnect().await;
                Err(e.into())
            }
        }
    }

    /// Shuts down the connection.  Idempotent; shutdown-phase errors are
    /// logged and swallowed.
    pub async fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(peer = ?self.peer_addr, error = %e, "ignoring shutdown error");
        }
        info!(peer = ?self.peer_addr, "transport disconnected");
    }

    /// Whether [`disconnect`](Self::disconnect) has run.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

// ── Tests ─────────────────────────────────────────────────────────────────────
