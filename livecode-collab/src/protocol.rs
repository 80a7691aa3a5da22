//! Binary session protocol between editors and the coordinator.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded message:
//! ```text
//! client ──► ClientMessage { Join | Change | Presence | SetMode | Leave | Ping }
//! client ◄── ServerMessage { RoomState | Change | Presence | MembersChanged |
//!                            HostChanged | ModeChanged | PresenceRemoved |
//!                            RequestPresenceReplay | Evicted | Error | Pong }
//! ```
//!
//! `Change` and `Presence` payloads are opaque to the transport. The
//! coordinator only decodes them to validate and merge; relays always carry
//! the raw bytes.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one participant's writes in the replica and awareness table.
pub type ReplicaId = u64;

/// Durable document key as known by the document store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One logical editor connection. Assigned by the server on accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Room edit mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Mode {
    /// Every member may edit.
    #[default]
    Open,
    /// Only the host may edit; everyone else observes.
    Locked,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Open => f.write_str("open"),
            Mode::Locked => f.write_str("locked"),
        }
    }
}

/// Public view of a room member, as sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub username: String,
    pub replica_id: ReplicaId,
}

/// Machine-readable error category carried by `ServerMessage::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Document does not exist in the store.
    NotFound,
    /// Store did not answer in time or failed.
    Unavailable,
    /// Request was not valid for this connection.
    Rejected,
    /// Server is shutting the room down.
    Closing,
}

/// Messages sent by an editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Enter the room of `document_id`, writing as `replica_id`.
    Join {
        document_id: DocumentId,
        replica_id: ReplicaId,
    },
    /// Opaque replica delta (yrs v1 update).
    Change(Vec<u8>),
    /// Encoded [`crate::presence::PresenceUpdate`].
    Presence(Vec<u8>),
    /// Host-only: switch the room edit mode.
    SetMode(Mode),
    /// Leave the current room without closing the connection.
    Leave,
    /// Keep-alive; answered with `ServerMessage::Pong`.
    Ping,
}

/// Messages pushed by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Full room state, sent only to a connection that just joined.
    RoomState {
        document_id: DocumentId,
        language: String,
        snapshot: Vec<u8>,
        mode: Mode,
        members: Vec<MemberInfo>,
        host: ConnectionId,
        you: ConnectionId,
    },
    /// Delta relayed verbatim from another member.
    Change(Vec<u8>),
    /// Presence update relayed verbatim from another member.
    Presence(Vec<u8>),
    MembersChanged {
        members: Vec<MemberInfo>,
        host: ConnectionId,
    },
    HostChanged {
        host: ConnectionId,
    },
    ModeChanged(Mode),
    /// A departed replica's awareness entry was dropped.
    PresenceRemoved {
        replica_id: ReplicaId,
    },
    /// A new member arrived; re-send your presence so it converges.
    RequestPresenceReplay,
    /// A newer connection of the same user replaced this one in the room.
    Evicted,
    Error {
        code: ErrorCode,
        message: String,
    },
    Pong,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

impl ClientMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::Change(_) => "change",
            ClientMessage::Presence(_) => "presence",
            ClientMessage::SetMode(_) => "set_mode",
            ClientMessage::Leave => "leave",
            ClientMessage::Ping => "ping",
        }
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Invalid identity header: {0}")]
    InvalidHeader(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Not connected")]
    NotConnected,
    #[error("Room is locked by the host")]
    ReadOnly,
    #[error("WebSocket error: {0}")]
    Transport(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ProtocolError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ProtocolError::Transport(e.to_string())
    }
}
