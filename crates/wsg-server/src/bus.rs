//! In-process message bus.
//!
//! A [`Pipeline`] that forwards every accepted message onto a bounded queue
//! for an agent loop to consume. The agent answers by publishing
//! [`OutboundMessage`]s, which the channel drains through its router.

use tokio::sync::mpsc;
use wsg_protocol::{InboundMessage, OutboundMessage};

use crate::pipeline::{Pipeline, PipelineError};

/// Queue depth used by [`MessageBus::default_pair`].
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Consumer ends of the bus.
pub struct BusReceivers {
    pub inbound: mpsc::Receiver<InboundMessage>,
    pub outbound: mpsc::Receiver<OutboundMessage>,
}

#[derive(Clone)]
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> (Self, BusReceivers) {
        let (inbound_tx, inbound) = mpsc::channel(capacity.max(1));
        let (outbound_tx, outbound) = mpsc::channel(capacity.max(1));
        (
            Self { inbound_tx, outbound_tx },
            BusReceivers { inbound, outbound },
        )
    }

    pub fn default_pair() -> (Self, BusReceivers) {
        Self::new(DEFAULT_BUS_CAPACITY)
    }

    /// Sender for replies, handed to whatever produces them.
    pub fn outbound_sender(&self) -> mpsc::Sender<OutboundMessage> {
        self.outbound_tx.clone()
    }

    pub async fn publish_outbound(&self, message: OutboundMessage) -> Result<(), PipelineError> {
        self.outbound_tx
            .send(message)
            .await
            .map_err(|_| PipelineError::Closed)
    }
}

impl Pipeline for MessageBus {
    async fn process(&self, message: InboundMessage) -> Result<(), PipelineError> {
        self.inbound_tx
            .send(message)
            .await
            .map_err(|_| PipelineError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn process_forwards_to_inbound_queue() {
        let (bus, mut rx) = MessageBus::new(4);
        bus.process(InboundMessage::new("127.0.0.1", "s1", "hello"))
            .await
            .unwrap();
        let msg = rx.inbound.recv().await.unwrap();
        assert_eq!(msg.session_id, "s1");
        assert_eq!(msg.content, "hello");
    }

    #[tokio::test]
    async fn outbound_round_trip() {
        let (bus, mut rx) = MessageBus::new(4);
        bus.publish_outbound(OutboundMessage::new("s1", "reply"))
            .await
            .unwrap();
        bus.outbound_sender()
            .send(OutboundMessage::new("s2", "other"))
            .await
            .unwrap();
        assert_eq!(rx.outbound.recv().await.unwrap().session_id, "s1");
        assert_eq!(rx.outbound.recv().await.unwrap().session_id, "s2");
    }

    #[tokio::test]
    async fn closed_consumer_is_reported() {
        let (bus, rx) = MessageBus::new(4);
        drop(rx);
        let err = bus
            .process(InboundMessage::new("127.0.0.1", "s1", "hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Closed));
    }
}
