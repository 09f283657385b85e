//! LAN chat server entry point.
//!
//! Loads the TOML configuration, binds the TCP listener, and starts the UDP
//! discovery responder so clients on the subnet can find this server
//! without any addressing.  Every accepted connection becomes a session
//! running the chat role below.
//!
//! ```text
//! main()
//!  └─ ServerConfig::load()     -- TOML, all fields defaulted
//!  └─ Listener::start()
//!       ├─ DiscoveryResponder  (UDP, answers DISCOVER_SERVER probes)
//!       └─ accept loop         (one Session per connection)
//!  └─ ctrl_c  →  shutdown()
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use lanlink_core::protocol::frame;
use lanlink_core::{Frame, FrameBody};
use lanlink_net::{
    DiscoveryConfig, Listener, ListenerConfig, PacketDispatcher, SessionConfig, SessionContext,
    SessionRole, TransportConfig,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::ServerConfig;

/// Server-side chat role: logs every inbound message and acknowledges
/// `Connect` frames with a greeting.
struct ChatServer {
    name: String,
}

impl SessionRole for ChatServer {
    fn register_handlers(&self, dispatcher: &PacketDispatcher, ctx: &SessionContext) {
        let session = ctx.id();
        dispatcher.register_handler(frame::MESSAGE, 0, move |incoming| {
            Box::pin(async move {
                if let FrameBody::Message { text, sender } = incoming.body {
                    info!(%session, "{sender}: {text}");
                }
                Ok(())
            })
        });

        let name = self.name.clone();
        let greeter = ctx.clone();
        dispatcher.register_handler(frame::CONNECT, 0, move |_incoming| {
            let name = name.clone();
            let greeter = greeter.clone();
            Box::pin(async move {
                info!(session = %greeter.id(), "client announced itself");
                let welcome = Frame::message(format!("welcome to {name}"), name.clone());
                if let Err(e) = greeter.send(&welcome).await {
                    warn!(error = %e, "failed to send welcome");
                }
                Ok(())
            })
        });
    }
}

fn config_path() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("lanlink-server.toml"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = config_path();
    let config = ServerConfig::load(&path)
        .with_context(|| format!("loading config from {}", path.display()))?;

    // Level from the config file, overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.server.log_level.clone())),
        )
        .init();

    info!(name = %config.server.name, "lanlink server starting");

    let listener_config = ListenerConfig {
        bind_addr: config.bind_addr().context("invalid bind address")?,
        port: config.network.port,
        name: config.server.name.clone(),
        version: Some(config.server.version.clone()),
        discovery: DiscoveryConfig {
            port: config.network.discovery_port,
            ..DiscoveryConfig::default()
        },
        session: SessionConfig {
            transport: TransportConfig {
                liveness_timeout: config.liveness_timeout(),
                heartbeat_interval: config.heartbeat_interval(),
            },
            worker_count: config.network.worker_count,
        },
    };

    let role = Arc::new(ChatServer {
        name: config.server.name.clone(),
    });
    let listener = Listener::start(listener_config, role)
        .await
        .context("starting listener")?;
    info!(addr = %listener.local_addr(), "ready; press Ctrl-C to exit");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    // The listener leaves accepted sessions to their own lifecycle; close
    // them here so the process exits without leaking tasks.
    let survivors = listener.shutdown().await;
    for session in survivors {
        session.close().await;
    }
    info!("lanlink server stopped");
    Ok(())
}
