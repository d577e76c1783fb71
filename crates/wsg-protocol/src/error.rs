//! Protocol error types.
//!
//! Two failure classes are kept apart: [`DecodeError`] means the frame was not a JSON object at all, while
//! [`EnvelopeError`] means the object was well-formed JSON but carried a
//! field of the wrong shape.

use thiserror::Error;

/// The inbound frame could not be decoded into a JSON object.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The bytes are not valid JSON (or not valid UTF-8).
    #[error("Invalid JSON format")]
    InvalidJson(#[source] serde_json::Error),

    /// Valid JSON, but the top-level value is not an object.
    #[error("Expected a JSON object")]
    NotAnObject,
}

impl DecodeError {
    /// Underlying parser message, if any. Used for logging only; the
    /// client-facing text is the `Display` impl.
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::InvalidJson(e) => Some(e.to_string()),
            Self::NotAnObject => None,
        }
    }
}

/// A decoded object carried a field with an unexpected type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("field `{field}` must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },
}

impl EnvelopeError {
    pub fn invalid_field(field: &'static str, expected: &'static str) -> Self {
        Self::InvalidField { field, expected }
    }
}
