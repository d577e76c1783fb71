//! Outbound router: delivers pipeline replies to the session they address.

use std::sync::Arc;

use tracing::{debug, error, warn};
use wsg_protocol::{OutboundEnvelope, OutboundMessage};
use wsg_transport::{SendError, SessionRegistry};

/// What happened to one outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// No live connection holds the session. Normal after a disconnect.
    NoSession,
    SendFailed,
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

#[derive(Clone)]
pub struct OutboundRouter {
    registry: Arc<SessionRegistry>,
}

impl OutboundRouter {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Send `message` as an `agent_response` to its session.
    ///
    /// Never fails and never waits on a client: unknown sessions, full
    /// outbound queues and closed connections are logged and reported
    /// through the returned [`Delivery`].
    pub async fn send(&self, message: &OutboundMessage) -> Delivery {
        let session_id = message.session_id.as_str();
        let Some(conn) = self.registry.lookup(session_id) else {
            warn!(%session_id, "No active WebSocket connection for session");
            return Delivery::NoSession;
        };

        match conn.try_send_json(&OutboundEnvelope::agent_response(message)) {
            Ok(()) => {
                debug!(%session_id, connection_id = %conn.id(), "Delivered agent response");
                Delivery::Delivered
            }
            Err(SendError::Full) => {
                warn!(%session_id, connection_id = %conn.id(), "Outbound queue full, dropping agent response");
                Delivery::SendFailed
            }
            Err(e) => {
                error!(%session_id, connection_id = %conn.id(), "Error sending WebSocket message: {e}");
                Delivery::SendFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value, json};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use wsg_transport::{ClientConnection, Outgoing};

    fn open(addr: &str) -> (Arc<ClientConnection>, mpsc::Receiver<Outgoing>) {
        ClientConnection::open(addr.parse().unwrap(), 8, CancellationToken::new())
    }

    fn decode(frame: Outgoing) -> Value {
        match frame {
            Outgoing::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn delivers_to_addressed_session_only() {
        let registry = Arc::new(SessionRegistry::new());
        let (a, mut rx_a) = open("10.0.0.1:1000");
        let (b, mut rx_b) = open("10.0.0.2:1000");
        let sa = registry.register(a).unwrap();
        registry.register(b).unwrap();

        let router = OutboundRouter::new(registry);
        let outcome = router.send(&OutboundMessage::new(&sa, "for A")).await;
        assert_eq!(outcome, Delivery::Delivered);

        let reply = decode(rx_a.try_recv().unwrap());
        assert_eq!(reply["type"], "agent_response");
        assert_eq!(reply["content"], "for A");
        assert_eq!(reply["session_id"], sa.as_str());
        assert!(reply["reply_to"].is_null());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_session_is_not_an_error() {
        let registry = Arc::new(SessionRegistry::new());
        let (a, _rx) = open("10.0.0.1:1000");
        registry.register(a).unwrap();

        let router = OutboundRouter::new(registry.clone());
        let outcome = router.send(&OutboundMessage::new("10.9.9.9_42", "lost")).await;
        assert_eq!(outcome, Delivery::NoSession);
        assert!(!outcome.is_delivered());
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test]
    async fn closed_connection_reports_send_failure() {
        let registry = Arc::new(SessionRegistry::new());
        let (a, _rx) = open("10.0.0.1:1000");
        let sa = registry.register(a.clone()).unwrap();
        a.abort();

        let router = OutboundRouter::new(registry.clone());
        let outcome = router.send(&OutboundMessage::new(&sa, "late")).await;
        assert_eq!(outcome, Delivery::SendFailed);
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test]
    async fn full_queue_fails_fast_without_blocking_others() {
        let registry = Arc::new(SessionRegistry::new());
        let (slow, _rx_slow) =
            ClientConnection::open("10.0.0.1:1000".parse().unwrap(), 1, CancellationToken::new());
        let (b, mut rx_b) = open("10.0.0.2:1000");
        let s_slow = registry.register(slow).unwrap();
        let sb = registry.register(b).unwrap();

        let router = OutboundRouter::new(registry.clone());
        assert!(router.send(&OutboundMessage::new(&s_slow, "first")).await.is_delivered());

        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            router.send(&OutboundMessage::new(&s_slow, "second")),
        )
        .await
        .expect("send waited on a full queue");
        assert_eq!(outcome, Delivery::SendFailed);
        assert_eq!(registry.active_count(), 2);

        assert!(router.send(&OutboundMessage::new(&sb, "for B")).await.is_delivered());
        assert_eq!(decode(rx_b.try_recv().unwrap())["content"], "for B");
    }

    #[tokio::test]
    async fn carries_reply_to_metadata_and_timestamp() {
        let registry = Arc::new(SessionRegistry::new());
        let (a, mut rx) = open("10.0.0.1:1000");
        let sa = registry.register(a).unwrap();

        let mut metadata = Map::new();
        metadata.insert("timestamp".into(), json!("2024-05-01T12:00:00Z"));
        metadata.insert("model".into(), json!("echo"));
        let message = OutboundMessage::new(&sa, "answer")
            .with_reply_to("msg-7")
            .with_metadata(metadata);

        let router = OutboundRouter::new(registry);
        assert!(router.send(&message).await.is_delivered());

        let reply = decode(rx.try_recv().unwrap());
        assert_eq!(reply["reply_to"], "msg-7");
        assert_eq!(reply["timestamp"], "2024-05-01T12:00:00Z");
        assert_eq!(reply["metadata"]["model"], "echo");
    }
}
