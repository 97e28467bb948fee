//! Binary relay protocol.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ room     │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ len+utf8 │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Payloads are Yrs v1 updates / state vectors for the sync types, a
//! bincode [`AwarenessMessage`] for `Awareness`, and a bincode [`PeerInfo`]
//! for `PeerJoined` / `PeerLeft`.

use inkboard_core::UserId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::awareness::{user_color, AwarenessMessage};

/// Message types for the relay protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector; the receiver answers with a `SyncStep2` diff
    SyncStep1 = 1,
    /// Yrs state diff response
    SyncStep2 = 2,
    /// Incremental CRDT delta update
    Delta = 3,
    /// Presence update or leave
    Awareness = 4,
    PeerJoined = 5,
    PeerLeft = 6,
    Ping = 7,
    Pong = 8,
}

/// Identity of one relay connection.
///
/// `peer_id` is per connection; `user_id` is the durable author identity
/// carried by drawing operations and awareness.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub user_id: UserId,
    pub name: String,
    /// Hex cursor colour, stable per user
    pub color: String,
}

impl PeerInfo {
    pub fn new(user_id: UserId, name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), user_id, name)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, user_id: UserId, name: impl Into<String>) -> Self {
        let color = user_color(&user_id).to_string();
        Self {
            peer_id,
            user_id,
            name: name.into(),
            color,
        }
    }
}

/// Top-level relay frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub room: String,
    /// Lamport clock of the sender
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, room: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            room: room.to_string(),
            clock,
            payload,
        }
    }

    /// Create a delta update message.
    pub fn delta(peer_id: Uuid, room: &str, clock: u64, yrs_update: Vec<u8>) -> Self {
        Self::new(MessageType::Delta, peer_id, room, clock, yrs_update)
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(peer_id: Uuid, room: &str, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, room, 0, state_vector)
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(peer_id: Uuid, room: &str, state_diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, room, 0, state_diff)
    }

    pub fn awareness(
        peer_id: Uuid,
        room: &str,
        clock: u64,
        message: &AwarenessMessage,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Awareness, peer_id, room, clock, message.encode()?))
    }

    pub fn peer_joined(room: &str, info: &PeerInfo) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::PeerJoined, info.peer_id, room, 0, encode_payload(info)?))
    }

    pub fn peer_left(room: &str, info: &PeerInfo) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::PeerLeft, info.peer_id, room, 0, encode_payload(info)?))
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, "", 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, "", 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the awareness payload.
    pub fn awareness_message(&self) -> Result<AwarenessMessage, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType);
        }
        AwarenessMessage::decode(&self.payload)
    }

    /// Parse the peer info payload of a join or leave notification.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if !matches!(self.msg_type, MessageType::PeerJoined | MessageType::PeerLeft) {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }
}

pub(crate) fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

pub(crate) fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Errors raised while framing or reading a [`SyncMessage`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode frame: {0}")]
    SerializationError(String),
    #[error("failed to decode frame: {0}")]
    DeserializationError(String),
    #[error("payload does not match the message type")]
    InvalidMessageType,
}
