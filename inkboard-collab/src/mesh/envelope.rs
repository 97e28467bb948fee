//! JSON envelopes carried over mesh data channels.
//!
//! ```text
//! {"type":"drawing","data":{...},"userId":"alice","timestamp":1700000000000}
//! ```
//!
//! Awareness payloads reuse the relay's bincode form, base64-encoded, so
//! both transports carry identical presence messages.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use inkboard_core::{now_millis, DrawingOperation, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::awareness::AwarenessMessage;
use crate::protocol::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Drawing,
    Awareness,
    Chat,
    File,
}

/// A file offered to the room, inlined as a data URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileShare {
    pub name: String,
    pub mime_type: String,
    pub data_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ChatBody {
    text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub data: Value,
    pub user_id: UserId,
    pub timestamp: u64,
}

impl Envelope {
    fn new(kind: EnvelopeKind, user_id: UserId, data: Value) -> Self {
        Self {
            kind,
            data,
            user_id,
            timestamp: now_millis(),
        }
    }

    pub fn drawing(op: &DrawingOperation) -> Result<Self, ProtocolError> {
        let data = serde_json::to_value(op).map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::new(EnvelopeKind::Drawing, op.user_id().clone(), data))
    }

    pub fn awareness(message: &AwarenessMessage) -> Result<Self, ProtocolError> {
        let bytes = message.encode()?;
        Ok(Self::new(
            EnvelopeKind::Awareness,
            message.user_id().clone(),
            Value::String(STANDARD.encode(bytes)),
        ))
    }

    pub fn chat(user_id: UserId, text: impl Into<String>) -> Self {
        let text: String = text.into();
        Self::new(EnvelopeKind::Chat, user_id, serde_json::json!({ "text": text }))
    }

    pub fn file(user_id: UserId, file: &FileShare) -> Result<Self, ProtocolError> {
        let data = serde_json::to_value(file).map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::new(EnvelopeKind::File, user_id, data))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    pub fn drawing_operation(&self) -> Result<DrawingOperation, ProtocolError> {
        self.expect_kind(EnvelopeKind::Drawing)?;
        DrawingOperation::deserialize(&self.data).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    pub fn awareness_message(&self) -> Result<AwarenessMessage, ProtocolError> {
        self.expect_kind(EnvelopeKind::Awareness)?;
        let encoded = self
            .data
            .as_str()
            .ok_or_else(|| ProtocolError::DeserializationError("awareness data is not a string".into()))?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        AwarenessMessage::decode(&bytes)
    }

    pub fn chat_text(&self) -> Result<String, ProtocolError> {
        self.expect_kind(EnvelopeKind::Chat)?;
        ChatBody::deserialize(&self.data)
            .map(|body| body.text)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    pub fn file_share(&self) -> Result<FileShare, ProtocolError> {
        self.expect_kind(EnvelopeKind::File)?;
        FileShare::deserialize(&self.data).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    fn expect_kind(&self, kind: EnvelopeKind) -> Result<(), ProtocolError> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(ProtocolError::DeserializationError(format!(
                "expected {kind:?} envelope, got {:?}",
                self.kind
            )))
        }
    }
}
