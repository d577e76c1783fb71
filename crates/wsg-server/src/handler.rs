//! Protocol handler: turns inbound frames into envelopes and work.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use wsg_protocol::{
    EnvelopeError, InboundEnvelope, InboundMessage, OutboundEnvelope, UserMessage, decode_object,
};
use wsg_transport::{ClientConnection, MessageHandler, SendError};

use crate::dispatcher::{DispatchError, Dispatcher};
use crate::pipeline::Pipeline;

/// Greeting carried by the `status` envelope.
pub const DEFAULT_WELCOME: &str = "Connected to wsgate";

/// Inbound content longer than this is cut in logs.
const LOG_PREVIEW_CHARS: usize = 100;

/// A fault while handling a well-formed frame. Reported to the client.
#[derive(Debug, Error)]
pub enum HandleError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

pub struct ProtocolHandler<P: Pipeline> {
    dispatcher: Arc<Dispatcher<P>>,
    welcome: String,
}

impl<P: Pipeline> ProtocolHandler<P> {
    pub fn new(dispatcher: Arc<Dispatcher<P>>) -> Self {
        Self {
            dispatcher,
            welcome: DEFAULT_WELCOME.to_string(),
        }
    }

    pub fn with_welcome(mut self, welcome: impl Into<String>) -> Self {
        self.welcome = welcome.into();
        self
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<P>> {
        &self.dispatcher
    }

    async fn handle_envelope(
        &self,
        conn: &ClientConnection,
        session_id: &str,
        envelope: InboundEnvelope,
    ) -> Result<(), HandleError> {
        match envelope {
            InboundEnvelope::UserMessage(message) => {
                self.dispatch_user_message(conn, session_id, message)?;
            }
            InboundEnvelope::Ping => {
                if let Err(e) = conn.send_json(&OutboundEnvelope::pong(session_id)).await {
                    debug!(%session_id, "Failed to send pong: {e}");
                }
            }
            InboundEnvelope::EmptyUserMessage => {
                debug!(%session_id, "Ignoring user_message without content");
            }
            InboundEnvelope::Unknown(kind) => {
                debug!(%session_id, ?kind, "Ignoring message of unknown type");
            }
        }
        Ok(())
    }

    /// Build the inbound message and hand it to the dispatcher.
    ///
    /// Client metadata is copied first and `connection_id` and `client_ip`
    /// are written over it, so a client cannot spoof either key. Every
    /// other client key passes through unchanged.
    fn dispatch_user_message(
        &self,
        conn: &ClientConnection,
        session_id: &str,
        message: UserMessage,
    ) -> Result<(), DispatchError> {
        let client_ip = conn.client_ip().to_string();
        info!(
            %session_id,
            %client_ip,
            "Message received: {}",
            preview(&message.content, LOG_PREVIEW_CHARS)
        );

        let mut metadata = message.metadata;
        metadata.insert("connection_id".into(), Value::String(conn.id().to_string()));
        metadata.insert("client_ip".into(), Value::String(client_ip.clone()));

        let inbound = InboundMessage::new(client_ip, session_id, message.content)
            .with_media(message.media)
            .with_metadata(metadata);
        self.dispatcher.dispatch(inbound)
    }

    async fn send_error(&self, conn: &ClientConnection, session_id: &str, content: String) {
        if let Err(e) = conn.send_json(&OutboundEnvelope::error(session_id, content)).await {
            debug!(%session_id, "Failed to send error envelope: {e}");
        }
    }
}

impl<P: Pipeline> MessageHandler for ProtocolHandler<P> {
    async fn on_connect(
        &self,
        conn: &Arc<ClientConnection>,
        session_id: &str,
    ) -> Result<(), SendError> {
        conn.send_json(&OutboundEnvelope::status(session_id, self.welcome.as_str()))
            .await
    }

    async fn handle_frame(&self, conn: &Arc<ClientConnection>, session_id: &str, frame: &[u8]) {
        let object = match decode_object(frame) {
            Ok(object) => object,
            Err(e) => {
                warn!(%session_id, detail = ?e.detail(), "Invalid JSON received: {e}");
                self.send_error(conn, session_id, e.to_string()).await;
                return;
            }
        };

        let result = match InboundEnvelope::from_object(object) {
            Ok(envelope) => self.handle_envelope(conn, session_id, envelope).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            error!(%session_id, "Error handling message: {e}");
            self.send_error(conn, session_id, e.to_string()).await;
        }
    }
}

/// First `max` characters of `text`, on a char boundary.
fn preview(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use wsg_transport::Outgoing;

    use crate::pipeline::PipelineError;

    #[derive(Default)]
    struct RecordingPipeline {
        seen: Mutex<Vec<InboundMessage>>,
    }

    impl Pipeline for RecordingPipeline {
        async fn process(&self, message: InboundMessage) -> Result<(), PipelineError> {
            self.seen.lock().push(message);
            Ok(())
        }
    }

    struct Harness {
        handler: ProtocolHandler<RecordingPipeline>,
        pipeline: Arc<RecordingPipeline>,
        conn: Arc<ClientConnection>,
        rx: mpsc::Receiver<Outgoing>,
    }

    impl Harness {
        fn new() -> Self {
            let pipeline = Arc::new(RecordingPipeline::default());
            let dispatcher = Arc::new(Dispatcher::new(pipeline.clone()));
            let (conn, rx) = ClientConnection::open(
                "192.168.1.20:5555".parse().unwrap(),
                16,
                CancellationToken::new(),
            );
            Self {
                handler: ProtocolHandler::new(dispatcher),
                pipeline,
                conn,
                rx,
            }
        }

        async fn send(&self, frame: &str) {
            self.handler.handle_frame(&self.conn, "sess_1", frame.as_bytes()).await;
        }

        fn next_reply(&mut self) -> Option<Value> {
            match self.rx.try_recv().ok()? {
                Outgoing::Text(text) => Some(serde_json::from_str(&text).unwrap()),
                other => panic!("unexpected frame: {other:?}"),
            }
        }

        async fn dispatched(&self) -> Vec<InboundMessage> {
            let dispatcher = self.handler.dispatcher();
            for _ in 0..200 {
                if dispatcher.in_flight() == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            self.pipeline.seen.lock().clone()
        }
    }

    #[tokio::test]
    async fn on_connect_sends_status() {
        let mut h = Harness::new();
        h.handler.on_connect(&h.conn, "sess_1").await.unwrap();
        let reply = h.next_reply().unwrap();
        assert_eq!(reply["type"], "status");
        assert_eq!(reply["content"], DEFAULT_WELCOME);
        assert_eq!(reply["session_id"], "sess_1");
    }

    #[tokio::test]
    async fn custom_welcome() {
        let pipeline = Arc::new(RecordingPipeline::default());
        let handler = ProtocolHandler::new(Arc::new(Dispatcher::new(pipeline)))
            .with_welcome("hi there");
        let (conn, mut rx) =
            ClientConnection::open("127.0.0.1:1".parse().unwrap(), 4, CancellationToken::new());
        handler.on_connect(&conn, "s").await.unwrap();
        let Some(Outgoing::Text(text)) = rx.recv().await else {
            panic!("expected text frame");
        };
        assert!(text.contains("hi there"));
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let mut h = Harness::new();
        h.send(r#"{"type":"ping"}"#).await;
        let reply = h.next_reply().unwrap();
        assert_eq!(reply["type"], "pong");
        assert_eq!(reply["session_id"], "sess_1");
        assert!(h.next_reply().is_none());
    }

    #[tokio::test]
    async fn malformed_json_gets_one_error() {
        let mut h = Harness::new();
        h.send("{not json").await;
        let reply = h.next_reply().unwrap();
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["content"], "Invalid JSON format");
        assert_eq!(reply["session_id"], "sess_1");
        assert!(h.next_reply().is_none());
        assert!(!h.conn.is_closed());
        assert!(h.dispatched().await.is_empty());
    }

    #[tokio::test]
    async fn non_object_gets_error() {
        let mut h = Harness::new();
        h.send("[1,2,3]").await;
        let reply = h.next_reply().unwrap();
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["content"], "Expected a JSON object");
    }

    #[tokio::test]
    async fn empty_content_is_ignored() {
        let mut h = Harness::new();
        h.send(r#"{"type":"user_message","content":""}"#).await;
        h.send(r#"{"type":"user_message"}"#).await;
        assert!(h.next_reply().is_none());
        assert!(h.dispatched().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_type_is_ignored() {
        let mut h = Harness::new();
        h.send(r#"{"type":"typing"}"#).await;
        h.send(r#"{"content":"no type"}"#).await;
        assert!(h.next_reply().is_none());
        assert!(h.dispatched().await.is_empty());
    }

    #[tokio::test]
    async fn bad_field_type_reports_fault() {
        let mut h = Harness::new();
        h.send(r#"{"type":"user_message","content":"hi","metadata":[1]}"#).await;
        let reply = h.next_reply().unwrap();
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["content"], "field `metadata` must be an object");
        assert!(h.dispatched().await.is_empty());
    }

    #[tokio::test]
    async fn user_message_is_dispatched_with_merged_metadata() {
        let mut h = Harness::new();
        h.send(
            r#"{"type":"user_message","content":"hello","media":["img.png"],
                "metadata":{"lang":"en","client_ip":"spoofed"}}"#,
        )
        .await;
        assert!(h.next_reply().is_none());

        let seen = h.dispatched().await;
        assert_eq!(seen.len(), 1);
        let msg = &seen[0];
        assert_eq!(msg.channel, "websocket");
        assert_eq!(msg.sender_id, "192.168.1.20");
        assert_eq!(msg.session_id, "sess_1");
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.media, vec![json!("img.png")]);
        assert_eq!(msg.metadata["lang"], "en");
        assert_eq!(msg.metadata["client_ip"], "192.168.1.20");
        assert_eq!(msg.metadata["connection_id"], h.conn.id().to_string());
    }

    #[tokio::test]
    async fn binary_frame_is_treated_as_json() {
        let mut h = Harness::new();
        h.handler
            .handle_frame(&h.conn, "sess_1", br#"{"type":"ping"}"#)
            .await;
        assert_eq!(h.next_reply().unwrap()["type"], "pong");
    }

    #[tokio::test]
    async fn dispatch_after_shutdown_reports_fault() {
        let mut h = Harness::new();
        h.handler.dispatcher().shutdown(Duration::from_millis(10)).await;
        h.send(r#"{"type":"user_message","content":"late"}"#).await;
        let reply = h.next_reply().unwrap();
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["content"], "dispatcher is shutting down");
        assert!(!h.conn.is_closed());
    }

    #[test]
    fn preview_respects_char_boundaries() {
        assert_eq!(preview("hello", 100), "hello");
        assert_eq!(preview("héllo", 2), "hé");
        let long = "x".repeat(150);
        assert_eq!(preview(&long, 100).len(), 100);
    }
}
