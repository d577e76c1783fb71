//! Events exchanged with the processing pipeline.
//!
//! [`InboundMessage`] is what the gateway hands to the pipeline for every
//! accepted `user_message`; [`OutboundMessage`] is what the pipeline hands
//! back, addressed by session id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::CHANNEL_NAME;

/// A user message ready for downstream processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Originating channel (always `"websocket"` for this gateway).
    pub channel: String,
    /// Remote IP of the sending client.
    pub sender_id: String,
    /// Session the reply must be routed to.
    pub session_id: String,
    pub content: String,
    #[serde(default)]
    pub media: Vec<Value>,
    /// Caller metadata merged with transport-derived fields.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(
        sender_id: impl Into<String>,
        session_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: CHANNEL_NAME.to_string(),
            sender_id: sender_id.into(),
            session_id: session_id.into(),
            content: content.into(),
            media: Vec::new(),
            metadata: Map::new(),
            received_at: Utc::now(),
        }
    }

    pub fn with_media(mut self, media: Vec<Value>) -> Self {
        self.media = media;
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Start a reply addressed back to this message's session.
    pub fn reply(&self, content: impl Into<String>) -> OutboundMessage {
        OutboundMessage::new(self.session_id.clone(), content)
    }
}

/// A pipeline reply addressed to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub session_id: String,
    pub content: String,
    /// Correlation id of the message being answered, if the pipeline tracks one.
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl OutboundMessage {
    pub fn new(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            content: content.into(),
            reply_to: None,
            metadata: Map::new(),
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}
