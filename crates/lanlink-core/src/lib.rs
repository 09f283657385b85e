//! # lanlink-core
//!
//! Shared library for lanlink containing the wire frame model, the JSON line
//! codec, and the peer record exchanged during LAN discovery.
//!
//! This crate is used by both the server and client applications.  It has no
//! dependency on sockets or the async runtime: everything here is plain data
//! plus (de)serialization, so the networking crates can be tested against it
//! without touching the OS.
//!
//! - **`protocol`** – the [`Frame`] type (one typed message), its body
//!   variants, and the newline-delimited JSON codec.
//! - **`domain`** – the [`PeerRecord`] a server advertises during discovery.

pub mod domain;
pub mod protocol;

pub use domain::peer::PeerRecord;
pub use protocol::codec::{decode_frame, encode_frame, ProtocolError};
pub use protocol::frame::{Frame, FrameBody};
