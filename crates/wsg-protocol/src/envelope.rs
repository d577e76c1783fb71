//! Server → client envelopes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::OutboundMessage;
use crate::types::{MessageType, MessageTypes};

/// Every frame the gateway writes to a client.
///
/// Serialized as a flat JSON object with a `type` tag, e.g.
/// `{"type":"pong","timestamp":"...","session_id":"..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEnvelope {
    /// Sent exactly once, right after a connection is admitted.
    Status {
        content: String,
        timestamp: String,
        session_id: String,
    },
    /// Reply to an application-level `ping`.
    Pong {
        timestamp: String,
        session_id: String,
    },
    /// Decode failure or handler fault. The connection stays open.
    Error {
        content: String,
        timestamp: String,
        session_id: String,
    },
    /// Asynchronous reply produced by the processing pipeline.
    AgentResponse {
        content: String,
        timestamp: String,
        session_id: String,
        reply_to: Option<String>,
        metadata: Map<String, Value>,
    },
}

/// Current UTC time as an RFC 3339 string.
pub fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339()
}

// ─────────────────────────────────────────────────────────────────────────────
// Helper constructors
// ─────────────────────────────────────────────────────────────────────────────

impl OutboundEnvelope {
    pub fn status(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Status {
            content: content.into(),
            timestamp: timestamp_now(),
            session_id: session_id.into(),
        }
    }

    pub fn pong(session_id: impl Into<String>) -> Self {
        Self::Pong {
            timestamp: timestamp_now(),
            session_id: session_id.into(),
        }
    }

    pub fn error(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Error {
            content: content.into(),
            timestamp: timestamp_now(),
            session_id: session_id.into(),
        }
    }

    /// Build an `agent_response` from a pipeline reply.
    ///
    /// The timestamp is taken from `metadata.timestamp` when the pipeline
    /// supplied one as a string, otherwise it is stamped now.
    pub fn agent_response(message: &OutboundMessage) -> Self {
        let timestamp = message
            .metadata
            .get("timestamp")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(timestamp_now);

        Self::AgentResponse {
            content: message.content.clone(),
            timestamp,
            session_id: message.session_id.clone(),
            reply_to: message.reply_to.clone(),
            metadata: message.metadata.clone(),
        }
    }

    /// The `type` tag this envelope serializes with.
    pub fn kind(&self) -> MessageType {
        match self {
            Self::Status { .. } => MessageTypes::STATUS,
            Self::Pong { .. } => MessageTypes::PONG,
            Self::Error { .. } => MessageTypes::ERROR,
            Self::AgentResponse { .. } => MessageTypes::AGENT_RESPONSE,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::Status { session_id, .. }
            | Self::Pong { session_id, .. }
            | Self::Error { session_id, .. }
            | Self::AgentResponse { session_id, .. } => session_id,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_matches_serialized_tag() {
        let envs = [
            OutboundEnvelope::status("s", "hi"),
            OutboundEnvelope::pong("s"),
            OutboundEnvelope::error("s", "bad"),
            OutboundEnvelope::agent_response(&OutboundMessage::new("s", "ok")),
        ];
        for env in envs {
            let value = serde_json::to_value(&env).unwrap();
            assert_eq!(value["type"], env.kind());
            assert_eq!(value["session_id"], "s");
        }
    }

    #[test]
    fn agent_response_prefers_pipeline_timestamp() {
        let mut msg = OutboundMessage::new("s1", "done");
        msg.metadata.insert("timestamp".into(), json!("2024-01-01T00:00:00Z"));
        let env = OutboundEnvelope::agent_response(&msg);
        match env {
            OutboundEnvelope::AgentResponse { timestamp, .. } => {
                assert_eq!(timestamp, "2024-01-01T00:00:00Z");
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn agent_response_ignores_non_string_timestamp() {
        let mut msg = OutboundMessage::new("s1", "done");
        msg.metadata.insert("timestamp".into(), json!(12345));
        let value = serde_json::to_value(OutboundEnvelope::agent_response(&msg)).unwrap();
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
        // original metadata is echoed untouched
        assert_eq!(value["metadata"]["timestamp"], 12345);
    }
}
