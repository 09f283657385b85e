//! # lanlink-net
//!
//! Runtime networking for lanlink: the framed TCP transport, the
//! priority-ordered packet dispatcher, the three-tier UDP discovery protocol,
//! and the session/listener lifecycle that wires them together.
//!
//! # Architecture
//!
//! ```text
//! Listener
//!  ├─ accept loop ───────────► Session (one per connection)
//!  │                            ├─ FrameTransport (send/recv + liveness)
//!  │                            ├─ PacketDispatcher (worker pool)
//!  │                            ├─ heartbeat loop (Ping + IsAlive check)
//!  │                            └─ receive loop (recv → enqueue)
//!  └─ DiscoveryResponder ◄──── discover() probe chain on the client side
//! ```
//!
//! Every long-running loop observes a `tokio::sync::watch` shutdown signal
//! owned by its session or listener; owners await task termination before
//! releasing sockets, so no loop ever touches a closed resource.

pub mod discovery;
pub mod dispatcher;
pub mod listener;
pub mod session;
pub mod transport;

pub use discovery::{discover, DiscoveryConfig, DiscoveryError, DiscoveryResponder};
pub use dispatcher::{HandlerError, PacketDispatcher};
pub use listener::{Listener, ListenerConfig, ListenerError};
pub use session::{
    RoleFuture, Session, SessionConfig, SessionContext, SessionError, SessionRole, SessionState,
};
pub use transport::{FrameTransport, TransportConfig, TransportError};
