//! Client connection handle.
//!
//! A [`ClientConnection`] is the shareable side of one open WebSocket. The
//! socket itself is owned by the connection task; everyone else (registry,
//! router, protocol handler) writes through the bounded outbound queue and
//! signals closure through the connection's cancellation token.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

/// Unique id of one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A frame queued for the connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    Close { code: u16, reason: String },
}

/// Failure to queue a frame for a client.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection is closed")]
    Closed,
    #[error("outbound queue is full")]
    Full,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Represents one admitted (or about to be admitted) client.
#[derive(Debug)]
pub struct ClientConnection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    connected_at: Instant,
    /// Last time any frame (including transport pongs) arrived.
    last_activity: Mutex<Instant>,
    tx: mpsc::Sender<Outgoing>,
    cancel: CancellationToken,
}

impl ClientConnection {
    /// Create a connection plus the receiving end of its outbound queue.
    ///
    /// `cancel` is normally a child of the server shutdown token so that
    /// stopping the server closes every connection.
    pub fn open(
        remote_addr: SocketAddr,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Outgoing>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let now = Instant::now();
        let conn = Arc::new(Self {
            id: ConnectionId::new(),
            remote_addr,
            connected_at: now,
            last_activity: Mutex::new(now),
            tx,
            cancel,
        });
        (conn, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Remote IP with IPv4-mapped IPv6 addresses unmapped.
    pub fn client_ip(&self) -> IpAddr {
        self.remote_addr.ip().to_canonical()
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Queue a text frame. Waits for queue space, giving up as soon as the
    /// connection is closed.
    pub async fn send_text(&self, text: String) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(SendError::Closed),
            sent = self.tx.send(Outgoing::Text(text)) => sent.map_err(|_| SendError::Closed),
        }
    }

    /// Serialize a value and queue it as a text frame.
    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<(), SendError> {
        let text = serde_json::to_string(value)?;
        self.send_text(text).await
    }

    /// Queue a text frame without waiting. A full queue is [`SendError::Full`].
    pub fn try_send_text(&self, text: String) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed);
        }
        self.tx.try_send(Outgoing::Text(text)).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    pub fn try_send_json<T: Serialize>(&self, value: &T) -> Result<(), SendError> {
        let text = serde_json::to_string(value)?;
        self.try_send_text(text)
    }

    /// Queue a close frame and cancel the connection.
    ///
    /// Closing an already closed connection is a no-op. The token is
    /// cancelled even when the frame could not be queued; the writer then
    /// falls back to a going-away close.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> Result<(), SendError> {
        if self.is_closed() {
            return Ok(());
        }
        let queued = self.tx.try_send(Outgoing::Close {
            code,
            reason: reason.into(),
        });
        self.cancel.cancel();
        queued.map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Cancel without queuing a close frame.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the connection has been closed or the server stops.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last inbound frame.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}
