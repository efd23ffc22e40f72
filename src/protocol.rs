//! Wire Protocol
//!
//! JSON control frames tagged by `type`, with CRDT update blobs carried as
//! padded standard base64. A raw binary WebSocket frame is accepted as a
//! CRDT update so the document channel can skip the base64 round trip.

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

use crate::admission::Role;
use crate::error::{Error, Result};
use crate::presence::{CursorPos, Selection, UserSnapshot};

/// Client frame `type` values the codec understands.
const CLIENT_FRAME_TYPES: [&str; 8] = [
    "hello",
    "leave",
    "crdt-update",
    "cursor",
    "typing",
    "language-change",
    "chat",
    "ping",
];

/// Fatal error kinds surfaced to clients (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    RoomNotFound,
    PasswordRequired,
    PasswordInvalid,
    RoomFull,
    Banned,
    ProtocolError,
    Unauthorized,
    Timeout,
    Backpressure,
    RoomUnavailable,
    InternalError,
}

/// Non-fatal warning kinds (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarningKind {
    PersistenceStalled,
    UnknownType,
    DroppedFrames,
}

/// Frames accepted from clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Hello {
        #[serde(default)]
        room: Option<String>,
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        display_name: Option<String>,
    },
    Leave,
    CrdtUpdate {
        #[serde(with = "b64")]
        blob: Vec<u8>,
    },
    Cursor {
        line: u32,
        col: u32,
        #[serde(default)]
        selection: Option<Selection>,
    },
    Typing {
        active: bool,
    },
    LanguageChange {
        language: String,
    },
    Chat {
        text: String,
    },
    Ping,
}

/// Room state handed to a freshly admitted session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub language: String,
    pub users_snapshot: Vec<UserSnapshot>,
    #[serde(with = "b64")]
    pub document_bytes: Vec<u8>,
}

/// Frames emitted to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    HelloAck {
        room: String,
        role_of_client: Role,
        snapshot: RoomSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    CrdtUpdate {
        #[serde(with = "b64")]
        blob: Vec<u8>,
        origin_principal_id: String,
    },
    UserJoined {
        user: UserSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    UserLeft {
        principal_id: String,
    },
    UsersSnapshot {
        users: Vec<UserSnapshot>,
    },
    #[serde(rename_all = "camelCase")]
    Cursor {
        principal_id: String,
        line: u32,
        col: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selection: Option<Selection>,
    },
    #[serde(rename_all = "camelCase")]
    Typing {
        principal_id: String,
        active: bool,
    },
    LanguageChange {
        language: String,
    },
    #[serde(rename_all = "camelCase")]
    Chat {
        principal_id: String,
        display_name: String,
        text: String,
        timestamp: i64,
    },
    Warning {
        kind: WarningKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Error {
        kind: ErrorKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Pong,
}

/// Delivery class of a server frame under outbox pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// Latest-wins, droppable when a session falls behind
    Transient,
    /// Must reach the client or the session closes
    Critical,
}

impl ServerFrame {
    pub fn class(&self) -> FrameClass {
        match self {
            ServerFrame::Cursor { .. }
            | ServerFrame::Typing { .. }
            | ServerFrame::Chat { .. }
            | ServerFrame::UsersSnapshot { .. } => FrameClass::Transient,
            _ => FrameClass::Critical,
        }
    }
}

/// Outcome of decoding one inbound message.
#[derive(Debug)]
pub enum Decoded {
    Frame(ClientFrame),
    /// Well-formed JSON with a `type` the codec does not know
    Unknown(String),
}

/// Decode a WebSocket message into a client frame. Binary frames are raw
/// CRDT updates; text frames are tagged JSON.
pub fn decode_client(message: &Message) -> Result<Decoded> {
    match message {
        Message::Binary(blob) => Ok(Decoded::Frame(ClientFrame::CrdtUpdate { blob: blob.clone() })),
        Message::Text(text) => {
            let value: serde_json::Value = serde_json::from_str(text)
                .map_err(|e| Error::Protocol(format!("malformed frame: {}", e)))?;
            let frame_type = value
                .get("type")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Protocol("frame is missing a type".to_string()))?
                .to_string();
            if !CLIENT_FRAME_TYPES.contains(&frame_type.as_str()) {
                return Ok(Decoded::Unknown(frame_type));
            }
            let frame = serde_json::from_value(value)
                .map_err(|e| Error::Protocol(format!("malformed {} frame: {}", frame_type, e)))?;
            Ok(Decoded::Frame(frame))
        }
        other => Err(Error::Protocol(format!("unexpected message: {:?}", other))),
    }
}

/// Encode a server frame as a text WebSocket message.
pub fn encode_server(frame: &ServerFrame) -> Message {
    // ServerFrame serialization cannot fail: every payload is plain data
    let json = serde_json::to_string(frame).unwrap_or_else(|e| {
        format!(
            "{{\"type\":\"error\",\"kind\":\"InternalError\",\"detail\":\"{}\"}}",
            e
        )
    });
    Message::Text(json)
}

/// Encode a client frame (used by embedded clients and the test suite).
pub fn encode_client(frame: &ClientFrame) -> Message {
    let json = serde_json::to_string(frame).unwrap_or_default();
    Message::Text(json)
}

/// Base64 (standard alphabet, padding required) byte-string fields.
pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}
