//! Wire protocol: typed client/server message unions.
//!
//! Binary WebSocket frames carry bincode (serde mode, standard config); text
//! frames carry JSON. The server answers each connection in the encoding of
//! the last frame it received.
//!
//! ```text
//!  Client                                Server
//!    │── Join{room, name} ───────────────►│
//!    │◄──────────── Joined{content, v} ───│  full document, once
//!    │── Submit{op @ v} ─────────────────►│  rebase, apply, v+1
//!    │◄──────────────────── Ack{v+1} ─────│  (peers get Broadcast{op', v+1})
//!    │── CursorUpdate{pos @ v} ──────────►│  (peers get Cursor{..})
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use scribe_core::{ClientId, Content, Operation, OtError, RoomId};

use crate::presence::{CursorPosition, UserColor};
use crate::session::SessionError;

/// Frame encoding of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// bincode on binary frames
    #[default]
    Binary,
    /// JSON on text frames
    Json,
}

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    /// Enter a room (or re-enter it for a fresh snapshot).
    Join { room_id: RoomId, display_name: String },
    /// Commit an operation authored against `operation.base_version()`.
    Submit { operation: Operation },
    /// Report the local caret or selection, stated against `version`.
    CursorUpdate {
        room_id: RoomId,
        position: CursorPosition,
        version: u64,
    },
    Leave { room_id: RoomId },
    Ping,
}

/// Why a submission (or join) was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Malformed,
    VersionMismatch,
    OutOfOrder,
    NotJoined,
    RoomFull,
}

impl RejectReason {
    /// The client has to rejoin for a fresh snapshot before editing again.
    pub fn requires_resync(self) -> bool {
        matches!(
            self,
            RejectReason::VersionMismatch | RejectReason::OutOfOrder | RejectReason::NotJoined
        )
    }
}

impl From<&OtError> for RejectReason {
    fn from(err: &OtError) -> Self {
        match err {
            OtError::MalformedOperation(_) => RejectReason::Malformed,
            OtError::VersionMismatch(_) => RejectReason::VersionMismatch,
            OtError::OutOfOrderOperation { .. } => RejectReason::OutOfOrder,
        }
    }
}

impl From<&SessionError> for RejectReason {
    fn from(err: &SessionError) -> Self {
        match err {
            SessionError::Ot(e) => e.into(),
            SessionError::NotJoined { .. } | SessionError::RoomMismatch { .. } => RejectReason::NotJoined,
            SessionError::RoomFull { .. } => RejectReason::RoomFull,
        }
    }
}

/// Messages sent by the server, both replies and unsolicited events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    Joined {
        room_id: RoomId,
        client_id: ClientId,
        content: Content,
        version: u64,
        users: Vec<String>,
    },
    /// The author's submission was committed at `version`.
    Ack {
        room_id: RoomId,
        base_version: u64,
        version: u64,
    },
    Reject {
        room_id: RoomId,
        reason: RejectReason,
        message: String,
    },
    /// A foreign operation, already rebased, committed at `version`.
    Broadcast {
        room_id: RoomId,
        operation: Operation,
        version: u64,
    },
    Cursor {
        room_id: RoomId,
        client_id: ClientId,
        display_name: String,
        color: UserColor,
        position: CursorPosition,
        version: u64,
    },
    CursorRemoved { room_id: RoomId, client_id: ClientId },
    UsersUpdated { room_id: RoomId, display_names: Vec<String> },
    /// The connection fell behind the room's event stream; rejoin.
    ResyncRequired { room_id: RoomId },
    Error { message: String },
    Pong,
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error { message: message.into() }
    }

    /// Reject carrying the reason derived from `err`.
    pub fn reject(room_id: impl Into<RoomId>, err: &SessionError) -> Self {
        ServerMessage::Reject {
            room_id: room_id.into(),
            reason: err.into(),
            message: err.to_string(),
        }
    }
}

fn encode_binary<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_binary<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(msg)
}

fn encode_json<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
}

impl ClientMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_binary(self)
    }

    /// Deserialize from binary wire format. Operations are validated.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_binary(bytes)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        encode_json(self)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        decode_json(text)
    }
}

impl ServerMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_binary(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_binary(bytes)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        encode_json(self)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        decode_json(text)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Not joined to a room")]
    NotJoined,
    #[error(transparent)]
    Operation(#[from] OtError),
}
