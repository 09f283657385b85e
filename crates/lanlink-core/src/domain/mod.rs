//! Domain entities shared between the discovery protocol and the binaries.

pub mod peer;

pub use peer::PeerRecord;
