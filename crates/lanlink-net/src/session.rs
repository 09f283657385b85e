//! Connection session: heartbeat, receive loop, and a forward-only state
//! machine over one [`FrameTransport`].
//!
//! A session owns the two per-connection loops.  The heartbeat loop sends a
//! ping on every interval and watches liveness; the receive loop reads
//! frames and feeds them to the session's [`PacketDispatcher`].  Either loop
//! requests shutdown when the connection degrades, and a reaper task
//! publishes [`SessionState::Closed`] only after both loops have actually
//! finished and the dispatcher has drained.
//!
//! Role-specific behaviour plugs in through [`SessionRole`]: the role
//! registers its frame handlers, then its fallible `on_connect` handshake
//! runs to completion — and only then does the session go Active.  A failed
//! handshake tears the transport down and surfaces as
//! [`SessionError::Handshake`] from `start`/`connect`.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use lanlink_core::protocol::frame;
use lanlink_core::Frame;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatcher::{HandlerError, PacketDispatcher};
use crate::transport::{FrameTransport, TransportConfig, TransportError};

/// Dispatch priority of the built-in ping handler.  Liveness bookkeeping
/// jumps ahead of ordinary traffic so a backlog cannot starve it.
pub const PING_PRIORITY: i32 = 10;

/// Lifecycle of a session.  Transitions are forward-only; a later state
/// never reverts to an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// TCP connect in progress or loops not yet running.
    Connecting,
    /// Both loops running, frames flowing.
    Active,
    /// Shutdown requested; loops are winding down.
    Closing,
    /// Both loops joined, dispatcher stopped, transport closed.
    Closed,
}

/// Errors surfaced when establishing or driving a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The role's `on_connect` handshake failed; the session never went
    /// Active.
    #[error("session handshake failed: {0}")]
    Handshake(#[source] HandlerError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Per-session knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub transport: TransportConfig,
    /// Dispatcher workers draining this session's queue.
    pub worker_count: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            worker_count: 2,
        }
    }
}

// ── Role seam ─────────────────────────────────────────────────────────────────

/// What a role's handshake future looks like.  Boxed so [`SessionRole`]
/// stays object-safe.
pub type RoleFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

/// Handle a role's handlers receive for talking back to the peer.
#[derive(Clone)]
pub struct SessionContext {
    id: Uuid,
    transport: Arc<FrameTransport>,
}

impl SessionContext {
    /// Identifier of the owning session.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Sends a frame to the peer.
    ///
    /// # Errors
    ///
    /// Propagates [`TransportError`] when the connection is gone.
    pub async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        self.transport.send(frame).await
    }
}

/// Role-specific behaviour of one end of a session.
///
/// Implementations register their frame handlers in `register_handlers`;
/// `on_connect` runs once, to completion, before the session goes Active.
/// It defaults to a no-op that succeeds.
pub trait SessionRole: Send + Sync {
    fn register_handlers(&self, dispatcher: &PacketDispatcher, ctx: &SessionContext);

    fn on_connect<'a>(&'a self, _ctx: &'a SessionContext) -> RoleFuture<'a> {
        Box::pin(async { Ok(()) })
    }
}

impl<T: SessionRole + ?Sized> SessionRole for Arc<T> {
    fn register_handlers(&self, dispatcher: &PacketDispatcher, ctx: &SessionContext) {
        (**self).register_handlers(dispatcher, ctx);
    }

    fn on_connect<'a>(&'a self, ctx: &'a SessionContext) -> RoleFuture<'a> {
        (**self).on_connect(ctx)
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// One live connection with its loops, dispatcher, and state machine.
pub struct Session {
    id: Uuid,
    transport: Arc<FrameTransport>,
    dispatcher: PacketDispatcher,
    state_tx: watch::Sender<SessionState>,
    shutdown_tx: watch::Sender<bool>,
}

impl Session {
    /// Dials `addr` and starts a session over the resulting stream.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Connect`] when the TCP connect fails and
    /// [`SessionError::Handshake`] when the role's `on_connect` fails.
    pub async fn connect<R: SessionRole>(
        addr: SocketAddr,
        role: R,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| SessionError::Connect { addr, source })?;
        info!(%addr, "connected");
        Self::start(stream, role, config).await
    }

    /// Wraps an already-established stream (typically an accepted one) in a
    /// session: registers handlers, runs the role handshake, then spins up
    /// the loops and goes Active.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Handshake`] when `on_connect` fails; the
    /// transport is disconnected and no loops are left running.
    pub async fn start<R: SessionRole>(
        stream: TcpStream,
        role: R,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let id = Uuid::new_v4();
        let transport = Arc::new(FrameTransport::new(stream, config.transport.clone()));
        let dispatcher = PacketDispatcher::default();
        let (state_tx, _) = watch::channel(SessionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = SessionContext {
            id,
            transport: Arc::clone(&transport),
        };

        // Built-in liveness handler; roles add theirs on top.
        let ping_transport = Arc::clone(&transport);
        dispatcher.register_handler(frame::PING, PING_PRIORITY, move |_frame| {
            let transport = Arc::clone(&ping_transport);
            Box::pin(async move {
                transport.update_last_ping();
                Ok(())
            })
        });
        role.register_handlers(&dispatcher, &ctx);
        dispatcher.init(config.worker_count).await;

        // The handshake gates Active: it completes before any loop starts.
        if let Err(e) = role.on_connect(&ctx).await {
            warn!(session = %id, error = %e, "handshake failed");
            dispatcher.stop().await;
            transport.disconnect().await;
            return Err(SessionError::Handshake(e));
        }

        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&transport),
            shutdown_tx.clone(),
            shutdown_rx.clone(),
        ));
        let receive = tokio::spawn(receive_loop(
            Arc::clone(&transport),
            dispatcher.clone(),
            shutdown_tx.clone(),
            shutdown_rx,
        ));

        transition(&state_tx, SessionState::Active);
        debug!(session = %id, peer = ?transport.peer_addr(), "session active");

        tokio::spawn(reaper(
            id,
            heartbeat,
            receive,
            dispatcher.clone(),
            Arc::clone(&transport),
            state_tx.clone(),
        ));

        Ok(Self {
            id,
            transport,
            dispatcher,
            state_tx,
            shutdown_tx,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.transport.peer_addr()
    }

    /// Sends a frame to the peer.
    ///
    /// # Errors
    ///
    /// Propagates [`TransportError`] when the connection is gone.
    pub async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        self.transport.send(frame).await
    }

    /// Queues an inbound frame for dispatch.  Exposed mainly for tests and
    /// local injection.
    pub fn enqueue(&self, frame: Frame) {
        self.dispatcher.enqueue(frame);
    }

    /// Requests shutdown and waits until the session reaches
    /// [`SessionState::Closed`].  Safe to call more than once.
    pub async fn close(&self) {
        transition(&self.state_tx, SessionState::Closing);
        let _ = self.shutdown_tx.send(true);
        self.wait_closed().await;
    }

    /// Waits for the session to reach [`SessionState::Closed`] without
    /// requesting shutdown itself.
    pub async fn wait_closed(&self) {
        let mut state_rx = self.state_tx.subscribe();
        let _ = state_rx
            .wait_for(|state| *state == SessionState::Closed)
            .await;
    }
}

/// Forward-only transition: later states never revert.
fn transition(state_tx: &watch::Sender<SessionState>, next: SessionState) {
    state_tx.send_if_modified(|state| {
        if next > *state {
            *state = next;
            true
        } else {
            false
        }
    });
}

// ── Loops ─────────────────────────────────────────────────────────────────────

async fn heartbeat_loop(
    transport: Arc<FrameTransport>,
    shutdown_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let interval = transport.config().heartbeat_interval;
    loop {
        if !transport.is_alive() {
            warn!(peer = ?transport.peer_addr(), "peer silent past liveness timeout");
            let _ = shutdown_tx.send(true);
            break;
        }
        if let Err(e) = transport.send(&Frame::ping()).await {
            debug!(error = %e, "heartbeat send failed");
            let _ = shutdown_tx.send(true);
            break;
        }
        tokio::select! {
            _ = shutdown_rx.wait_for(|stop| *stop) => break,
            _ = time::sleep(interval) => {}
        }
    }
    debug!("heartbeat loop finished");
}

async fn receive_loop(
    transport: Arc<FrameTransport>,
    dispatcher: PacketDispatcher,
    shutdown_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.wait_for(|stop| *stop) => break,
            received = transport.recv() => match received {
                Ok(Some(frame)) => dispatcher.enqueue(frame),
                Ok(None) => {} // keep-alive blank line
                Err(TransportError::Protocol(e)) => {
                    // One bad frame does not cost the connection.
                    warn!(error = %e, "dropping malformed frame");
                }
                Err(e) => {
                    debug!(error = %e, "receive loop ending");
                    let _ = shutdown_tx.send(true);
                    break;
                }
            }
        }
    }
    debug!("receive loop finished");
}

/// Waits for both loops, then tears the session down in order: dispatcher,
/// transport, state.
async fn reaper(
    id: Uuid,
    heartbeat: JoinHandle<()>,
    receive: JoinHandle<()>,
    dispatcher: PacketDispatcher,
    transport: Arc<FrameTransport>,
    state_tx: watch::Sender<SessionState>,
) {
    if let Err(e) = heartbeat.await {
        error!(session = %id, error = %e, "heartbeat loop panicked");
    }
    if let Err(e) = receive.await {
        error!(session = %id, error = %e, "receive loop panicked");
    }

    transition(&state_tx, SessionState::Closing);
    dispatcher.stop().await;
    transport.disconnect().await;
    transition(&state_tx, SessionState::Closed);
    info!(session = %id, "session closed");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
