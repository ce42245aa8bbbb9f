//! Frame: the realtime wire envelope for support-chat channels.
//!
//! ARCHITECTURE
//! ============
//! Anything that crosses a process boundary on a conversation channel is a
//! Frame: live broadcasts (`message`, `clear`) and store notifications
//! (`message:insert`, `conversation:update`, `conversation:delete`). Frames
//! are JSON so they fit in a Postgres `NOTIFY` payload, which caps them at
//! `NOTIFY_PAYLOAD_LIMIT` bytes.
//!
//! DESIGN
//! ======
//! - Flat data: payload is always `Map<String, Value>`, never nested.
//! - Routing looks only at `event`; typed decoding of `data` happens once, at
//!   the store boundary, into `Message` / `Conversation`.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{ConversationId, now_ms};

// =============================================================================
// EVENT NAMES
// =============================================================================

/// Live broadcast carrying a just-sent message.
pub const EVENT_MESSAGE: &str = "message";

/// Live broadcast telling viewers the conversation was cleared.
pub const EVENT_CLEAR: &str = "clear";

/// Store notification for a durably written message row.
pub const EVENT_MESSAGE_INSERT: &str = "message:insert";

/// Store notification for a created or changed conversation row.
pub const EVENT_CONVERSATION_UPDATE: &str = "conversation:update";

/// Store notification for a deleted conversation row.
pub const EVENT_CONVERSATION_DELETE: &str = "conversation:delete";

/// Postgres rejects `NOTIFY` payloads of this many bytes or more.
pub const NOTIFY_PAYLOAD_LIMIT: usize = 8000;

// =============================================================================
// TYPES
// =============================================================================

/// Flat key-value payload. Alias to reduce noise in signatures.
pub type Data = HashMap<String, serde_json::Value>;

/// The realtime envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: Uuid,
    /// Milliseconds since Unix epoch. Set automatically at construction.
    pub ts: i64,
    pub conversation_id: ConversationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub event: String,
    pub data: Data,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("unknown frame event: {0}")]
    UnknownEvent(String),
    #[error("frame payload is not a JSON object")]
    NotAnObject,
    #[error("frame payload invalid: {0}")]
    Payload(#[from] serde_json::Error),
}

impl ErrorCode for FrameError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownEvent(_) => "E_FRAME_EVENT",
            Self::NotAnObject => "E_FRAME_SHAPE",
            Self::Payload(_) => "E_FRAME_PAYLOAD",
        }
    }
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured errors.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

impl Frame {
    pub fn new(conversation_id: ConversationId, event: impl Into<String>, data: Data) -> Self {
        Self { id: Uuid::new_v4(), ts: now_ms(), conversation_id, from: None, event: event.into(), data }
    }

    /// Build a frame whose data is the flattened fields of `payload`.
    ///
    /// # Errors
    ///
    /// Returns an error if `payload` does not serialize to a JSON object.
    pub fn with_payload<T: Serialize>(
        conversation_id: ConversationId,
        event: &str,
        payload: &T,
    ) -> Result<Self, FrameError> {
        let serde_json::Value::Object(map) = serde_json::to_value(payload)? else {
            return Err(FrameError::NotAnObject);
        };
        Ok(Self::new(conversation_id, event, map.into_iter().collect()))
    }

    /// Decode the flat data map into a typed payload.
    ///
    /// # Errors
    ///
    /// Returns an error if required fields are missing or mistyped.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        let map: serde_json::Map<String, serde_json::Value> =
            self.data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Ok(serde_json::from_value(serde_json::Value::Object(map))?)
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

impl Frame {
    #[must_use]
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }
}

// =============================================================================
// ROUTING / CODEC
// =============================================================================

impl Frame {
    /// Broadcasts are ephemeral; everything else reflects a durable write.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        matches!(self.event.as_str(), EVENT_MESSAGE | EVENT_CLEAR)
    }

    /// Encode as a JSON text payload.
    ///
    /// # Errors
    ///
    /// Returns an error if a data value fails to serialize.
    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Length of `text` once encoded as a JSON string, quotes included.
    #[must_use]
    pub fn encoded_len(text: &str) -> usize {
        serde_json::to_string(text).map_or(usize::MAX, |s| s.len())
    }

    /// Decode a JSON text payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid frame.
    pub fn decode(raw: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
#[path = "frame_test.rs"]
mod tests;
