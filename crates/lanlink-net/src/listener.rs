//! Server-side accept loop with an attached discovery responder.
//!
//! A [`Listener`] binds the configured TCP endpoint, advertises it over the
//! UDP discovery responder, and wraps every accepted connection in a
//! [`Session`] sharing one role.  Finished sessions are swept from the
//! roster as new connections arrive.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use lanlink_core::PeerRecord;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::discovery::{self, DiscoveryConfig, DiscoveryError, DiscoveryResponder};
use crate::session::{Session, SessionConfig, SessionRole, SessionState};

/// Errors raised when starting a listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// How the listener binds and advertises itself.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address the TCP listener binds.
    pub bind_addr: IpAddr,
    /// TCP port; `0` lets the OS pick one.
    pub port: u16,
    /// Human-readable name sent in discovery replies.
    pub name: String,
    /// Optional version string sent in discovery replies.
    pub version: Option<String>,
    pub discovery: DiscoveryConfig,
    pub session: SessionConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            port: 5000,
            name: "Unknown Server".to_string(),
            version: None,
            discovery: DiscoveryConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

/// Accepting endpoint plus its discovery responder and live sessions.
pub struct Listener {
    local_addr: SocketAddr,
    sessions: Arc<Mutex<Vec<Arc<Session>>>>,
    responder: DiscoveryResponder,
    accept_task: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl Listener {
    /// Binds the TCP endpoint, starts the discovery responder, and begins
    /// accepting connections, each wrapped in a [`Session`] driven by
    /// `role`.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::Bind`] when the TCP bind fails and
    /// [`ListenerError::Discovery`] when the responder cannot start.
    pub async fn start(
        config: ListenerConfig,
        role: Arc<dyn SessionRole>,
    ) -> Result<Self, ListenerError> {
        let bind = SocketAddr::from((config.bind_addr, config.port));
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|source| ListenerError::Bind { addr: bind, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ListenerError::Bind { addr: bind, source })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Advertise the LAN-reachable address, not the wildcard bind.
        let advertised_ip = match config.bind_addr {
            IpAddr::V4(ip) if ip.is_unspecified() => discovery::local_lan_addr()
                .map(IpAddr::V4)
                .unwrap_or(config.bind_addr),
            other => other,
        };
        let advert = PeerRecord {
            name: config.name.clone(),
            ip: advertised_ip,
            port: local_addr.port(),
            version: config.version.clone(),
            discovered_at: Utc::now(),
        };
        let responder =
            DiscoveryResponder::start(advert, config.discovery.port, shutdown_rx.clone()).await?;

        let sessions = Arc::new(Mutex::new(Vec::new()));
        info!(%local_addr, name = %config.name, "listener accepting connections");
        let accept_task = tokio::spawn(accept_loop(
            listener,
            role,
            config.session,
            Arc::clone(&sessions),
            shutdown_rx,
        ));

        Ok(Self {
            local_addr,
            sessions,
            responder,
            accept_task,
            shutdown_tx,
        })
    }

    /// The TCP address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Snapshot of the sessions that have not yet closed.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        sessions.retain(|s| s.state() != SessionState::Closed);
        sessions.clone()
    }

    /// Stops accepting and answering discovery, awaiting both.
    ///
    /// Accepted sessions are never closed here; they manage their own
    /// lifecycle.  The surviving ones are returned so the caller can decide
    /// what happens to them.
    pub async fn shutdown(self) -> Vec<Arc<Session>> {
        let _ = self.shutdown_tx.send(true);
        let _ = self.accept_task.await;
        self.responder.join().await;

        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        sessions.retain(|s| s.state() != SessionState::Closed);
        info!(surviving = sessions.len(), "listener stopped");
        sessions.drain(..).collect()
    }
}

async fn accept_loop(
    listener: TcpListener,
    role: Arc<dyn SessionRole>,
    session_config: SessionConfig,
    sessions: Arc<Mutex<Vec<Arc<Session>>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let (stream, peer): (TcpStream, SocketAddr) = tokio::select! {
            _ = shutdown_rx.wait_for(|stop| *stop) => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            }
        };

        info!(%peer, "connection accepted");
        let session = match Session::start(stream, Arc::clone(&role), session_config.clone()).await
        {
            Ok(session) => Arc::new(session),
            Err(e) => {
                warn!(%peer, error = %e, "session setup failed");
                continue;
            }
        };

        let mut roster = sessions.lock().unwrap_or_else(PoisonError::into_inner);
        roster.retain(|s| s.state() != SessionState::Closed);
        roster.push(session);
        debug!(live = roster.len(), "session roster updated");
    }
    debug!("accept loop finished");
}
