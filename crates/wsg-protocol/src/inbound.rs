//! Client → server envelopes.
//!
//! Decoding is split in two steps so callers can tell a garbage frame
//! ([`decode_object`] → [`DecodeError`]) from a well-formed object with a
//! bad field ([`InboundEnvelope::from_object`] → [`EnvelopeError`]).

use serde_json::{Map, Value};

use crate::error::{DecodeError, EnvelopeError};
use crate::types::MessageTypes;

/// Parse raw frame bytes into a JSON object.
pub fn decode_object(raw: &[u8]) -> Result<Map<String, Value>, DecodeError> {
    match serde_json::from_slice::<Value>(raw).map_err(DecodeError::InvalidJson)? {
        Value::Object(map) => Ok(map),
        _ => Err(DecodeError::NotAnObject),
    }
}

/// Payload of a `user_message` envelope.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UserMessage {
    pub content: String,
    pub media: Vec<Value>,
    pub metadata: Map<String, Value>,
}

/// A decoded inbound envelope, dispatched on its `type` tag.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEnvelope {
    /// `user_message` with non-empty content.
    UserMessage(UserMessage),
    /// `user_message` whose content is missing or empty. Ignored by policy.
    EmptyUserMessage,
    /// Application-level heartbeat.
    Ping,
    /// Any other `type`, or none at all. Ignored.
    Unknown(Option<String>),
}

impl InboundEnvelope {
    /// Interpret a decoded object.
    pub fn from_object(mut object: Map<String, Value>) -> Result<Self, EnvelopeError> {
        let kind = object.get("type").and_then(Value::as_str).map(str::to_string);

        match kind.as_deref() {
            Some(MessageTypes::USER_MESSAGE) => {
                let content = match object.remove("content") {
                    None | Some(Value::Null) => String::new(),
                    Some(Value::String(s)) => s,
                    Some(_) => return Err(EnvelopeError::invalid_field("content", "a string")),
                };
                if content.is_empty() {
                    return Ok(Self::EmptyUserMessage);
                }

                let media = match object.remove("media") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => items,
                    Some(_) => return Err(EnvelopeError::invalid_field("media", "a list")),
                };

                let metadata = match object.remove("metadata") {
                    None | Some(Value::Null) => Map::new(),
                    Some(Value::Object(map)) => map,
                    Some(_) => return Err(EnvelopeError::invalid_field("metadata", "an object")),
                };

                Ok(Self::UserMessage(UserMessage { content, media, metadata }))
            }
            Some(MessageTypes::PING) => Ok(Self::Ping),
            _ => Ok(Self::Unknown(kind)),
        }
    }

    /// Convenience for tests and tools: both decode steps in one call.
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        let object = decode_object(raw)?;
        Ok(Self::from_object(object)?)
    }
}

/// Either decode step failing, for [`InboundEnvelope::parse`].
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}
