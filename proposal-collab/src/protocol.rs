//! Wire formats for document updates.
//!
//! Two layers:
//!
//! ```text
//! Channel message (JSON, what peers see)
//! ┌─────────────┬──────────────────────────────────────┐
//! │ event       │ payload                              │
//! │ "y-update"  │ { "update": "<base64 binary delta>" } │
//! └─────────────┴──────────────────────────────────────┘
//!
//! Relay frame (bincode, WsTransport <-> RelayServer)
//! ┌──────────┬──────────┬─────────┬──────────────────┐
//! │ variant  │ channel  │ event   │ payload (JSON)   │
//! └──────────┴──────────┴─────────┴──────────────────┘
//! ```
//!
//! Deltas are opaque here: they are moved, never inspected.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Event name for incremental document updates.
pub const UPDATE_EVENT: &str = "y-update";

/// Payload field carrying the encoded delta.
pub const UPDATE_FIELD: &str = "update";

/// A structured message carried on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// Message type discriminator, e.g. [`UPDATE_EVENT`]
    pub event: String,
    pub payload: Value,
}

impl ChannelMessage {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    /// Build a `y-update` message for a binary delta.
    pub fn update(delta: &[u8]) -> Self {
        Self::new(UPDATE_EVENT, encode_update(delta))
    }

    pub fn is_update(&self) -> bool {
        self.event == UPDATE_EVENT
    }
}

/// Typed view of the update payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub update: String,
}

impl UpdatePayload {
    pub fn from_delta(delta: &[u8]) -> Self {
        Self {
            update: STANDARD.encode(delta),
        }
    }

    /// Read the payload out of a channel message body. Unknown fields are
    /// ignored.
    pub fn from_value(payload: &Value) -> Result<Self, ProtocolError> {
        Self::deserialize(payload).map_err(|_| ProtocolError::MissingUpdate)
    }

    pub fn into_delta(self) -> Result<Vec<u8>, ProtocolError> {
        STANDARD
            .decode(self.update)
            .map_err(|e| ProtocolError::InvalidEncoding(e.to_string()))
    }
}

impl From<UpdatePayload> for Value {
    fn from(payload: UpdatePayload) -> Self {
        let mut map = serde_json::Map::with_capacity(1);
        map.insert(UPDATE_FIELD.to_string(), Value::String(payload.update));
        Value::Object(map)
    }
}

/// Encode a binary delta as `{ "update": "<base64>" }`.
pub fn encode_update(delta: &[u8]) -> Value {
    UpdatePayload::from_delta(delta).into()
}

/// Decode the binary delta from an update payload.
pub fn decode_update(payload: &Value) -> Result<Vec<u8>, ProtocolError> {
    UpdatePayload::from_value(payload)?.into_delta()
}

/// Frames exchanged between [`crate::transport::ws::WsTransport`] and
/// [`crate::relay::RelayServer`].
///
/// JSON payloads travel as text because bincode cannot describe
/// self-describing values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Publish { channel: String, event: String, payload: String },
    /// Server → client delivery of another client's publication.
    Message { channel: String, event: String, payload: String },
    Subscribed { channel: String },
    Rejected { channel: String, reason: String },
    /// Server → client: an established subscription was ended by the relay.
    Dropped { channel: String, reason: String },
    Ping,
    Pong,
}

impl RelayFrame {
    /// Build a publish frame from a channel message.
    pub fn publish(channel: impl Into<String>, message: &ChannelMessage) -> Self {
        Self::Publish {
            channel: channel.into(),
            event: message.event.clone(),
            payload: message.payload.to_string(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

/// Parse the JSON text of a relayed payload.
pub fn parse_payload(text: &str) -> Result<Value, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("payload has no string `update` field")]
    MissingUpdate,
    #[error("update is not valid base64: {0}")]
    InvalidEncoding(String),
    #[error("payload is not valid JSON: {0}")]
    InvalidPayload(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}
