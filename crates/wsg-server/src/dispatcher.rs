//! Background dispatch of user messages to the pipeline.
//!
//! Every dispatched message runs in its own task so a slow pipeline never
//! holds up the connection's receive loop. Tasks are tracked, which lets
//! [`Dispatcher::shutdown`] drain them and cancel the stragglers.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use wsg_protocol::InboundMessage;

use crate::pipeline::Pipeline;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

pub struct Dispatcher<P: Pipeline> {
    pipeline: Arc<P>,
    tasks: TaskTracker,
    /// Replaced on reopen so a restarted channel gets a live token
    cancel: Mutex<CancellationToken>,
}

impl<P: Pipeline> Dispatcher<P> {
    pub fn new(pipeline: Arc<P>) -> Self {
        Self {
            pipeline,
            tasks: TaskTracker::new(),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn pipeline(&self) -> &Arc<P> {
        &self.pipeline
    }

    /// Hand `message` to the pipeline on a background task and return
    /// immediately.
    pub fn dispatch(&self, message: InboundMessage) -> Result<(), DispatchError> {
        // Held through the spawn; shutdown closes the tracker under it.
        let guard = self.cancel.lock();
        if self.tasks.is_closed() || guard.is_cancelled() {
            return Err(DispatchError::ShuttingDown);
        }
        let cancel = guard.clone();

        let pipeline = self.pipeline.clone();
        let session_id = message.session_id.clone();
        debug!(%session_id, in_flight = self.tasks.len(), "Dispatching message");

        self.tasks.spawn(async move {
            tokio::select! {
                result = pipeline.process(message) => {
                    if let Err(e) = result {
                        error!(%session_id, "Pipeline failed to process message: {e}");
                    }
                }
                () = cancel.cancelled() => {
                    debug!(%session_id, "Dispatch cancelled");
                }
            }
        });
        drop(guard);
        Ok(())
    }

    /// Messages handed to the pipeline and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.tasks.is_closed()
    }

    /// Refuse new work, wait up to `drain_timeout` for in-flight messages,
    /// then cancel the rest and wait for them to unwind.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        {
            let _guard = self.cancel.lock();
            self.tasks.close();
        }
        let pending = self.tasks.len();
        if pending == 0 {
            return;
        }

        info!(pending, "Draining dispatched messages");
        if tokio::time::timeout(drain_timeout, self.tasks.wait()).await.is_err() {
            warn!(
                remaining = self.tasks.len(),
                "Dispatch drain timed out after {drain_timeout:?}, cancelling"
            );
            self.cancel.lock().cancel();
            self.tasks.wait().await;
        }
    }

    /// Accept work again after a shutdown.
    pub fn reopen(&self) {
        let mut cancel = self.cancel.lock();
        if cancel.is_cancelled() {
            *cancel = CancellationToken::new();
        }
        self.tasks.reopen();
    }
}
