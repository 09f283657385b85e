//! Protocol module containing the frame model and the line codec.

pub mod codec;
pub mod frame;

pub use codec::{decode_frame, encode_frame, ProtocolError};
pub use frame::{Frame, FrameBody};
