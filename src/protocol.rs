// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire protocol: JSON control messages and the two-frame push.
//!
//! Every push is a text header followed by exactly one binary frame:
//!
//! ```text
//! server → client   {"type":"data_full","timestamp":100,"data_size":4}
//! server → client   <4 bytes>
//!
//! server → client   {"type":"data_update","timestamp_from":95,"timestamp_to":100,"data_size":3}
//! server → client   <3 bytes>
//!
//! server → client   {"type":"error","error":"no_data"}          (no binary)
//!
//! client → server   {"type":"request_full","error":"none"}
//! client → server   {"type":"data_received","client_id":"…","last_successful_timestamp":"100"}
//! ```
//!
//! The receiving side runs a [`FrameAssembler`]:
//!
//! ```text
//!          header                    binary (len == data_size)
//!   ┌──────────────┐ ───────────► ┌────────────┐ ──────────► Complete
//!   │AwaitingHeader│              │AwaitingBody│
//!   └──────────────┘ ◄─────────── └────────────┘
//!                     size mismatch / new header ⇒ Resync
//! ```

use crate::error::{FanoutError, Result};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use tokio_tungstenite::tungstenite::Message;

/// `error` value sent when no snapshot has been published yet.
pub const NO_DATA: &str = "no_data";

// =============================================================================
// Client → server
// =============================================================================

/// Control messages a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ask for a full snapshot regardless of acknowledged state.
    RequestFull {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Acknowledge that the push at `last_successful_timestamp` was applied.
    DataReceived {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(deserialize_with = "number_or_string")]
        last_successful_timestamp: u64,
    },
}

impl ClientMessage {
    pub fn request_full(reason: impl Into<String>) -> Self {
        Self::RequestFull {
            error: Some(reason.into()),
        }
    }

    pub fn ack(client_id: impl Into<String>, timestamp: u64) -> Self {
        Self::DataReceived {
            client_id: Some(client_id.into()),
            last_successful_timestamp: timestamp,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Outcome of parsing one inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(ClientMessage),
    /// Well-formed JSON with a `type` we do not handle.
    Unknown(String),
}

/// Parse a client text frame.
///
/// Unknown `type` values are not an error; anything that is not a JSON
/// object with a string `type`, or a known type with bad fields, is.
pub fn parse_client_message(text: &str) -> Result<Inbound> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| FanoutError::Protocol("message has no string `type`".to_string()))?;

    match kind {
        "request_full" | "data_received" => Ok(Inbound::Message(serde_json::from_value(value)?)),
        other => Ok(Inbound::Unknown(other.to_string())),
    }
}

/// Deployed clients send the timestamp as a decimal string.
fn number_or_string<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
        Null,
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
        Raw::Null => Ok(0),
    }
}

// =============================================================================
// Server → client
// =============================================================================

/// Text headers the server sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    DataFull {
        timestamp: u64,
        data_size: usize,
    },
    DataUpdate {
        timestamp_from: u64,
        timestamp_to: u64,
        data_size: usize,
    },
    Error {
        error: String,
    },
}

impl ServerMessage {
    pub fn no_data() -> Self {
        Self::Error {
            error: NO_DATA.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One outbound WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(s) => s.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::text(text),
            Frame::Binary(bytes) => Message::binary(bytes),
        }
    }
}

/// A snapshot or diff ready to send (or just received).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Push {
    Full { timestamp: u64, payload: Bytes },
    Diff { from: u64, to: u64, payload: Bytes },
}

impl Push {
    /// Metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Push::Full { .. } => "full",
            Push::Diff { .. } => "diff",
        }
    }

    /// Timestamp the client will be at after applying this push.
    pub fn target_timestamp(&self) -> u64 {
        match self {
            Push::Full { timestamp, .. } => *timestamp,
            Push::Diff { to, .. } => *to,
        }
    }

    pub fn payload(&self) -> &Bytes {
        match self {
            Push::Full { payload, .. } | Push::Diff { payload, .. } => payload,
        }
    }

    pub fn header(&self) -> ServerMessage {
        match self {
            Push::Full { timestamp, payload } => ServerMessage::DataFull {
                timestamp: *timestamp,
                data_size: payload.len(),
            },
            Push::Diff { from, to, payload } => ServerMessage::DataUpdate {
                timestamp_from: *from,
                timestamp_to: *to,
                data_size: payload.len(),
            },
        }
    }

    /// Header frame then body frame.
    pub fn into_frames(self) -> Result<[Frame; 2]> {
        let header = self.header().to_json()?;
        let payload = match self {
            Push::Full { payload, .. } | Push::Diff { payload, .. } => payload,
        };
        Ok([Frame::Text(header), Frame::Binary(payload)])
    }
}

// =============================================================================
// Receiving side
// =============================================================================

/// Why a receiver dropped what it had and asked for a full snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncReason {
    /// Body length differs from the header's `data_size`.
    SizeMismatch { expected: usize, actual: usize },
    /// Binary frame with no header before it.
    UnexpectedBinary,
    /// A new header arrived while a body was still expected.
    HeaderInterrupted,
    /// Header text was not a recognizable server message.
    MalformedHeader,
    /// A diff's origin is not the timestamp the client holds.
    OriginMismatch { held: u64, origin: u64 },
}

impl ResyncReason {
    /// Value for the `error` field of `request_full`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResyncReason::SizeMismatch { .. } => "size_mismatch",
            ResyncReason::UnexpectedBinary => "unexpected_binary",
            ResyncReason::HeaderInterrupted => "header_interrupted",
            ResyncReason::MalformedHeader => "malformed_header",
            ResyncReason::OriginMismatch { .. } => "origin_mismatch",
        }
    }
}

impl fmt::Display for ResyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResyncReason::SizeMismatch { expected, actual } => {
                write!(f, "expected {} bytes, got {}", expected, actual)
            }
            ResyncReason::OriginMismatch { held, origin } => {
                write!(f, "diff from {} but holding {}", origin, held)
            }
            other => f.write_str(other.as_str()),
        }
    }
}

/// What the assembler produced from one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    /// Header accepted, waiting for its body.
    Pending,
    Complete(Push),
    NoData,
    /// An `error` message other than `no_data`.
    ServerError(String),
    Resync(ResyncReason),
}

#[derive(Debug, Clone, Default)]
enum AssemblerState {
    #[default]
    AwaitingHeader,
    AwaitingBody(ServerMessage),
}

/// Client-side pairing of headers and bodies.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    state: AssemblerState,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_awaiting_body(&self) -> bool {
        matches!(self.state, AssemblerState::AwaitingBody(_))
    }

    /// Forget any half-received push.
    pub fn reset(&mut self) {
        self.state = AssemblerState::AwaitingHeader;
    }

    pub fn on_text(&mut self, text: &str) -> Assembled {
        let interrupted = self.is_awaiting_body();
        self.state = AssemblerState::AwaitingHeader;

        let header: ServerMessage = match serde_json::from_str(text) {
            Ok(header) => header,
            Err(_) => return Assembled::Resync(ResyncReason::MalformedHeader),
        };
        if interrupted {
            return Assembled::Resync(ResyncReason::HeaderInterrupted);
        }

        match header {
            ServerMessage::Error { error } if error == NO_DATA => Assembled::NoData,
            ServerMessage::Error { error } => Assembled::ServerError(error),
            header => {
                self.state = AssemblerState::AwaitingBody(header);
                Assembled::Pending
            }
        }
    }

    pub fn on_binary(&mut self, payload: Bytes) -> Assembled {
        let header = match std::mem::take(&mut self.state) {
            AssemblerState::AwaitingHeader => {
                return Assembled::Resync(ResyncReason::UnexpectedBinary)
            }
            AssemblerState::AwaitingBody(header) => header,
        };

        let expected = match &header {
            ServerMessage::DataFull { data_size, .. }
            | ServerMessage::DataUpdate { data_size, .. } => *data_size,
            ServerMessage::Error { .. } => return Assembled::Resync(ResyncReason::UnexpectedBinary),
        };
        if payload.len() != expected {
            return Assembled::Resync(ResyncReason::SizeMismatch {
                expected,
                actual: payload.len(),
            });
        }

        match header {
            ServerMessage::DataFull { timestamp, .. } => Assembled::Complete(Push::Full { timestamp, payload }),
            ServerMessage::DataUpdate {
                timestamp_from,
                timestamp_to,
                ..
            } => Assembled::Complete(Push::Diff {
                from: timestamp_from,
                to: timestamp_to,
                payload,
            }),
            ServerMessage::Error { .. } => Assembled::Resync(ResyncReason::UnexpectedBinary),
        }
    }
}
