//! Frame Codec
//!
//! JSON encoding and decoding for feed frames.
//!
//! Servers normally send one object per text frame; some batch several
//! objects into a JSON array. Both decode into a list of
//! [`InboundMessage`]s. A frame without a string `type` field is a protocol
//! error.
//!
//! When a `market_data` frame carries its `data_type` inside the payload
//! instead of at the top level, the codec lifts it so routing works either
//! way.

use serde::Serialize;
use serde_json::Value;

use crate::domain::streaming::{InboundMessage, frame_type};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame has no string `type` field.
    #[error("frame has no string `type` field")]
    MissingType,

    /// Invalid message format.
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
}

/// JSON codec for feed frames.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode a text frame into one or more messages.
    ///
    /// Each element of a batched array decodes on its own, so one bad element
    /// yields one `Err` next to its valid siblings. A frame that is not JSON
    /// at all yields a single `Err`.
    pub fn decode(&self, text: &str) -> Vec<Result<InboundMessage, CodecError>> {
        let trimmed = text.trim();

        if trimmed.starts_with('[') {
            match serde_json::from_str::<Vec<Value>>(trimmed) {
                Ok(raw) => raw.into_iter().map(|v| self.decode_value(v)).collect(),
                Err(e) => vec![Err(e.into())],
            }
        } else if trimmed.starts_with('{') {
            let message = serde_json::from_str::<Value>(trimmed)
                .map_err(CodecError::from)
                .and_then(|value| self.decode_value(value));
            vec![message]
        } else {
            let preview: String = trimmed.chars().take(50).collect();
            vec![Err(CodecError::InvalidFormat(format!(
                "expected JSON object or array, got: {preview}..."
            )))]
        }
    }

    /// Decode a text frame, failing on the first bad element.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON parsing fails or any element lacks a `type`.
    pub fn decode_all(&self, text: &str) -> Result<Vec<InboundMessage>, CodecError> {
        self.decode(text).into_iter().collect()
    }

    /// Decode one JSON object.
    fn decode_value(&self, value: Value) -> Result<InboundMessage, CodecError> {
        if !value.get("type").is_some_and(Value::is_string) {
            return Err(CodecError::MissingType);
        }

        let mut message: InboundMessage = serde_json::from_value(value)?;

        if message.msg_type == frame_type::MARKET_DATA && message.data_type.is_none() {
            message.data_type = message
                .payload
                .get("data_type")
                .and_then(Value::as_str)
                .map(str::to_string);
        }

        Ok(message)
    }

    /// Encode a value to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<String, CodecError> {
        Ok(serde_json::to_string(value)?)
    }
}
