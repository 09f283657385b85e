//! The lanlink frame model.
//!
//! A [`Frame`] is one discrete, self-delimited unit of the wire protocol.
//! Every frame carries a string `kind` (the sole dispatch key, sent on the
//! wire as `Type`), a creation timestamp, and a body.  Most frames are bare
//! control records (`Ping`, `Connect`, ...); the `Message` kind additionally
//! carries chat text and a sender name.

use chrono::{DateTime, Utc};
use std::fmt;

// ── Well-known frame kinds ────────────────────────────────────────────────────

/// Liveness probe sent by the heartbeat loop.
pub const PING: &str = "Ping";
/// Greeting sent by a client right after the transport comes up.
pub const CONNECT: &str = "Connect";
/// Chat message; the only kind with a non-control body.
pub const MESSAGE: &str = "Message";

// ── Frame ─────────────────────────────────────────────────────────────────────

/// One typed message exchanged over a lanlink session.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Dispatch key, e.g. `"Ping"` or `"Message"`.
    pub kind: String,
    /// Creation time, carried on the wire as `Timestamp`.
    pub timestamp: DateTime<Utc>,
    /// Payload; [`FrameBody::Control`] for every kind except `Message`.
    pub body: FrameBody,
}

/// Payload variants of a [`Frame`].
///
/// Kinds decode structurally: `"Message"` decodes to [`FrameBody::Message`],
/// every other kind (known or not) decodes to [`FrameBody::Control`].
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    /// Bare frame: `Type` and `Timestamp` only.
    Control,
    /// Chat payload carried by `Message` frames.
    Message {
        /// Message content.
        text: String,
        /// Sender's identifier, e.g. a username.
        sender: String,
    },
}

impl Frame {
    /// Creates a bare control frame of the given kind, timestamped now.
    pub fn control(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            timestamp: Utc::now(),
            body: FrameBody::Control,
        }
    }

    /// Creates a `Ping` control frame.
    pub fn ping() -> Self {
        Self::control(PING)
    }

    /// Creates a `Message` frame with the given text and sender.
    pub fn message(text: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            kind: MESSAGE.to_string(),
            timestamp: Utc::now(),
            body: FrameBody::Message {
                text: text.into(),
                sender: sender.into(),
            },
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            FrameBody::Control => write!(f, "{}", self.kind),
            FrameBody::Message { text, sender } => {
                write!(f, "{} from {sender}: {text}", self.kind)
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
