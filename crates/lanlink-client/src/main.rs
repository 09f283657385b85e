//! LAN chat client entry point.
//!
//! With a `host:port` argument the client dials that address directly;
//! without one it runs the discovery probe chain (localhost, broadcast,
//! subnet scan) and connects to the first server found.  Once connected it
//! announces itself with a `Connect` frame, prints inbound messages, and
//! sends each stdin line as a chat message until EOF or Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context};
use lanlink_core::protocol::frame;
use lanlink_core::{Frame, FrameBody};
use lanlink_net::{
    discover, DiscoveryConfig, HandlerError, PacketDispatcher, RoleFuture, Session, SessionConfig,
    SessionContext, SessionRole,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Client-side chat role: prints what the server says and announces itself
/// once the session is live.
struct ChatClient {
    nickname: String,
}

impl SessionRole for ChatClient {
    fn register_handlers(&self, dispatcher: &PacketDispatcher, _ctx: &SessionContext) {
        dispatcher.register_handler(frame::MESSAGE, 0, move |incoming| {
            Box::pin(async move {
                if let FrameBody::Message { text, sender } = incoming.body {
                    println!("[{sender}] {text}");
                }
                Ok(())
            })
        });
    }

    fn on_connect<'a>(&'a self, ctx: &'a SessionContext) -> RoleFuture<'a> {
        Box::pin(async move {
            ctx.send(&Frame::control(frame::CONNECT))
                .await
                .map_err(HandlerError::new)?;
            info!(nickname = %self.nickname, "announced to server");
            Ok(())
        })
    }
}

/// Resolves the server address: explicit `host:port` argument (hostname or
/// IP literal), or the first peer the discovery chain finds.
async fn resolve_server(arg: Option<String>) -> anyhow::Result<SocketAddr> {
    if let Some(arg) = arg {
        return tokio::net::lookup_host(arg.as_str())
            .await
            .with_context(|| format!("could not resolve {arg:?}, expected host:port"))?
            .next()
            .with_context(|| format!("{arg:?} resolved to no addresses"));
    }

    info!("no server given; discovering");
    let peers = discover(&DiscoveryConfig::default())
        .await
        .context("discovery found no servers; pass host:port explicitly")?;
    let chosen = &peers[0];
    info!(server = %chosen, others = peers.len() - 1, "discovered server");
    Ok(chosen.addr())
}

fn nickname() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "anonymous".to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let addr = resolve_server(std::env::args().nth(1)).await?;
    let nickname = nickname();

    let role = Arc::new(ChatClient {
        nickname: nickname.clone(),
    });
    let session = Session::connect(addr, role, SessionConfig::default())
        .await
        .context("connecting to server")?;
    info!(%addr, "connected; type messages, Ctrl-D or Ctrl-C to quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
            _ = session.wait_closed() => {
                warn!("server closed the connection");
                break;
            }
            line = lines.next_line() => match line.context("reading stdin")? {
                Some(text) if text.trim().is_empty() => {}
                Some(text) => {
                    let frame = Frame::message(text, nickname.clone());
                    if let Err(e) = session.send(&frame).await {
                        bail!("send failed: {e}");
                    }
                }
                None => {
                    info!("stdin closed");
                    break;
                }
            }
        }
    }

    session.close().await;
    info!("disconnected");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
