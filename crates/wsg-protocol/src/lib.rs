//! wsgate protocol types
//!
//! JSON envelopes exchanged with browser clients, plus the events exchanged
//! with the downstream processing pipeline. This crate is the single source
//! of truth for envelope shapes, type tags, and close codes.

pub mod envelope;
pub mod error;
pub mod events;
pub mod inbound;
pub mod types;

pub use envelope::{OutboundEnvelope, timestamp_now};
pub use error::{DecodeError, EnvelopeError};
pub use events::{InboundMessage, OutboundMessage};
pub use inbound::{InboundEnvelope, ParseError, UserMessage, decode_object};
pub use types::{
    CHANNEL_NAME, CLOSE_GOING_AWAY, CLOSE_POLICY_VIOLATION, MessageType, MessageTypes,
};
