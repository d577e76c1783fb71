//! The downstream processing interface.

use std::future::Future;

use thiserror::Error;
use wsg_protocol::InboundMessage;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline is closed")]
    Closed,
    #[error("{0}")]
    Failed(String),
}

impl PipelineError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Consumes accepted user messages.
///
/// Called concurrently from background tasks, one per message, so
/// implementations must be reentrant. Replies travel back separately as
/// [`wsg_protocol::OutboundMessage`]s through the outbound router.
pub trait Pipeline: Send + Sync + 'static {
    fn process(
        &self,
        message: InboundMessage,
    ) -> impl Future<Output = Result<(), PipelineError>> + Send;
}
