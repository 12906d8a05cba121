//! Binary frames exchanged between clients and the sync server.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! The document is not part of the frame: a WebSocket connection is scoped
//! to one room by its request path.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::presence::{AwarenessMessage, CursorColor};

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector; the receiver answers with the missing diff
    SyncStep1 = 1,
    /// Full state or diff
    SyncStep2 = 2,
    /// Incremental CRDT update
    Update = 3,
    /// Presence update or removal (JSON payload)
    Awareness = 4,
    PeerJoined = 5,
    PeerLeft = 6,
    Ping = 7,
    Pong = 8,
    /// Join refused or room failure (UTF-8 reason)
    Error = 9,
}

/// Peer identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    /// Account behind the connection, if authenticated.
    pub user_id: Option<String>,
    /// `#rrggbb`; assigned by the server on join.
    pub color: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
            user_id: None,
            color: CursorColor::from_uuid(peer_id).to_hex(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Largest frame, and largest decoded payload, accepted from a peer (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 << 20;

/// Decoding limit for untrusted bytes; length prefixes past it fail
/// before anything is allocated.
fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_FRAME_SIZE>()
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    /// Sender-local sequence number
    pub clock: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn bare(msg_type: MessageType, peer_id: Uuid) -> Self {
        Self {
            msg_type,
            peer_id,
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Create an incremental update message.
    pub fn update(peer_id: Uuid, clock: u64, update: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Update,
            peer_id,
            clock,
            payload: update,
        }
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(peer_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self {
            payload: state_vector,
            ..Self::bare(MessageType::SyncStep1, peer_id)
        }
    }

    /// Create a sync step 2 (state or diff response).
    pub fn sync_step2(peer_id: Uuid, state: Vec<u8>) -> Self {
        Self {
            payload: state,
            ..Self::bare(MessageType::SyncStep2, peer_id)
        }
    }

    pub fn awareness(peer_id: Uuid, clock: u64, message: &AwarenessMessage) -> Result<Self, ProtocolError> {
        Ok(Self {
            clock,
            payload: message.encode()?,
            ..Self::bare(MessageType::Awareness, peer_id)
        })
    }

    pub fn peer_joined(info: &PeerInfo) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            payload,
            ..Self::bare(MessageType::PeerJoined, info.peer_id)
        })
    }

    pub fn peer_left(peer_id: Uuid) -> Self {
        Self::bare(MessageType::PeerLeft, peer_id)
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::bare(MessageType::Ping, peer_id)
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::bare(MessageType::Pong, peer_id)
    }

    pub fn error(peer_id: Uuid, reason: &str) -> Self {
        Self {
            payload: reason.as_bytes().to_vec(),
            ..Self::bare(MessageType::Error, peer_id)
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, wire_config())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse awareness payload.
    pub fn awareness_message(&self) -> Result<AwarenessMessage, ProtocolError> {
        self.expect(MessageType::Awareness)?;
        AwarenessMessage::decode(&self.payload)
    }

    /// Parse peer info payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        self.expect(MessageType::PeerJoined)?;
        let (info, _) = bincode::serde::decode_from_slice(&self.payload, wire_config())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(info)
    }

    /// Parse the reason carried by an error frame.
    pub fn error_reason(&self) -> Result<String, ProtocolError> {
        self.expect(MessageType::Error)?;
        Ok(String::from_utf8_lossy(&self.payload).into_owned())
    }

    fn expect(&self, msg_type: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type == msg_type {
            Ok(())
        } else {
            Err(ProtocolError::InvalidMessageType(self.msg_type))
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected message type {0:?}")]
    InvalidMessageType(MessageType),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
}
