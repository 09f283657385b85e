//! JSON line codec for lanlink frames.
//!
//! Wire format: one frame per line of UTF-8 text (no BOM), newline-terminated
//! by the transport.  Each line is a single JSON object with at minimum a
//! `Type` tag and a `Timestamp`; the `Message` kind additionally carries
//! `Text` and `Sender`:
//!
//! ```text
//! {"Type":"Ping","Timestamp":"2026-08-26T09:15:00.120Z"}
//! {"Type":"Message","Timestamp":"...","Text":"hi","Sender":"alice"}
//! ```
//!
//! Decoding dispatches on the `Type` field: `"Message"` produces the Message
//! body, any other value — including an absent tag — produces a bare control
//! frame.  Unknown extra fields are ignored so newer peers can add fields
//! without breaking older ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::frame::{self, Frame, FrameBody};

/// Errors that can occur while encoding or decoding a frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The line is not valid JSON, or a field has the wrong shape.
    #[error("invalid frame JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A `Message` frame is missing one of its required fields.
    #[error("frame kind {kind:?} is missing required field {field:?}")]
    MissingField {
        kind: String,
        field: &'static str,
    },
}

/// On-the-wire shape of a frame.
///
/// `Text` and `Sender` are optional here so that one struct covers both
/// body variants; [`decode_frame`] enforces their presence for `Message`.
#[derive(Serialize, Deserialize)]
struct WireFrame {
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(rename = "Timestamp", default = "Utc::now")]
    timestamp: DateTime<Utc>,
    #[serde(rename = "Text", default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "Sender", default, skip_serializing_if = "Option::is_none")]
    sender: Option<String>,
}

/// Encodes a frame as a single line of JSON (without the trailing newline).
///
/// # Errors
///
/// Returns [`ProtocolError::Json`] if serialization fails.
pub fn encode_frame(frame: &Frame) -> Result<String, ProtocolError> {
    let (text, sender) = match &frame.body {
        FrameBody::Control => (None, None),
        FrameBody::Message { text, sender } => (Some(text.clone()), Some(sender.clone())),
    };
    let wire = WireFrame {
        kind: frame.kind.clone(),
        timestamp: frame.timestamp,
        text,
        sender,
    };
    Ok(serde_json::to_string(&wire)?)
}

/// Decodes one frame from a line of JSON.
///
/// A missing `Type` yields a control frame with an empty kind; a missing
/// `Timestamp` defaults to now.  A `Message` frame without `Text` or
/// `Sender` is rejected.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the line is not valid JSON or a `Message`
/// frame is structurally incomplete.
pub fn decode_frame(line: &str) -> Result<Frame, ProtocolError> {
    let wire: WireFrame = serde_json::from_str(line)?;

    let body = if wire.kind == frame::MESSAGE {
        let text = wire.text.ok_or(ProtocolError::MissingField {
            kind: wire.kind.clone(),
            field: "Text",
        })?;
        let sender = wire.sender.ok_or(ProtocolError::MissingField {
            kind: wire.kind.clone(),
            field: "Sender",
        })?;
        FrameBody::Message { text, sender }
    } else {
        FrameBody::Control
    };

    Ok(Frame {
        kind: wire.kind,
        timestamp: wire.timestamp,
        body,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
