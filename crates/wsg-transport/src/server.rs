//! WebSocket gateway server using Axum.
//!
//! [`TransportServer`] owns the listening socket and shutdown sequencing.
//! Every upgraded socket gets its own connection task which admits or
//! rejects the client by origin, registers a session, and runs the receive
//! loop. A second per-connection task drains the outbound queue and sends
//! transport-level pings.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use wsg_protocol::{CLOSE_GOING_AWAY, CLOSE_POLICY_VIOLATION};

use crate::client::{ClientConnection, ConnectionId, Outgoing, SendError};
use crate::policy::AllowFromPolicy;
use crate::registry::SessionRegistry;

/// Implemented by the protocol layer. The transport calls it once when a
/// session starts and once per inbound frame, in arrival order.
pub trait MessageHandler: Send + Sync + 'static {
    /// Send whatever greeting the protocol requires. An error ends the
    /// connection before the receive loop starts.
    fn on_connect(
        &self,
        conn: &Arc<ClientConnection>,
        session_id: &str,
    ) -> impl Future<Output = Result<(), SendError>> + Send;

    /// Handle one text or binary frame. Must not fail the connection; any
    /// error is reported to the client by the implementation itself.
    fn handle_frame(
        &self,
        conn: &Arc<ClientConnection>,
        session_id: &str,
        frame: &[u8],
    ) -> impl Future<Output = ()> + Send;
}

/// Transport server configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Hostname to bind to
    pub hostname: String,
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Remote addresses allowed to open a session
    pub allow_from: AllowFromPolicy,
    /// Interval between transport pings (`None` disables pings)
    pub ping_interval: Option<Duration>,
    /// Grace period past one ping interval before an idle client is dropped
    pub ping_timeout: Duration,
    /// Upper bound on waiting for a close handshake or connection teardown
    pub close_timeout: Duration,
    /// Maximum concurrent connections
    pub max_connections: Option<usize>,
    /// Outbound frames buffered per connection
    pub outbound_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".into(),
            port: 8765,
            allow_from: AllowFromPolicy::unrestricted(),
            ping_interval: Some(Duration::from_secs(20)),
            ping_timeout: Duration::from_secs(120),
            close_timeout: Duration::from_secs(10),
            max_connections: None,
            outbound_buffer: 256,
        }
    }
}

/// Supervisor lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server is already {0}")]
    AlreadyRunning(ServerState),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Shared state for the connection tasks.
struct AppState<H: MessageHandler> {
    handler: Arc<H>,
    config: TransportConfig,
    registry: Arc<SessionRegistry>,
    /// Parent of every connection's token; cancelled on stop
    shutdown: CancellationToken,
    /// Live connection tasks
    connections: TaskTracker,
    /// Admission slots when `max_connections` is set
    slots: Option<Arc<Semaphore>>,
}

/// Owns the listener and every connection task.
pub struct TransportServer<H: MessageHandler> {
    config: TransportConfig,
    handler: Arc<H>,
    registry: Arc<SessionRegistry>,
    state: ServerState,
    shutdown: CancellationToken,
    connections: TaskTracker,
    /// Accept loop task handle
    handle: Option<JoinHandle<()>>,
    /// Actual bound address
    local_addr: Option<SocketAddr>,
}

impl<H: MessageHandler> TransportServer<H> {
    pub fn new(config: TransportConfig, handler: Arc<H>) -> Self {
        Self::with_registry(config, handler, Arc::new(SessionRegistry::new()))
    }

    /// Use an existing registry so other components (the outbound router)
    /// can share it.
    pub fn with_registry(
        config: TransportConfig,
        handler: Arc<H>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            config,
            handler,
            registry,
            state: ServerState::Stopped,
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
            handle: None,
            local_addr: None,
        }
    }

    /// Bind the listener and start accepting connections.
    ///
    /// On bind failure the server stays `Stopped` and the error is returned.
    pub async fn start(&mut self) -> Result<SocketAddr, TransportError> {
        if self.state != ServerState::Stopped {
            return Err(TransportError::AlreadyRunning(self.state));
        }
        self.state = ServerState::Starting;

        let addr = format!("{}:{}", self.config.hostname, self.config.port);
        let listener =
            match tokio::net::TcpListener::bind((self.config.hostname.as_str(), self.config.port))
                .await
            {
                Ok(listener) => listener,
                Err(source) => {
                    self.state = ServerState::Stopped;
                    return Err(TransportError::Bind { addr, source });
                }
            };
        let local_addr = match listener.local_addr() {
            Ok(a) => a,
            Err(e) => {
                self.state = ServerState::Stopped;
                return Err(e.into());
            }
        };

        // Fresh token and tracker so a stopped server can be started again
        self.shutdown = CancellationToken::new();
        self.connections = TaskTracker::new();

        let state = Arc::new(AppState {
            handler: self.handler.clone(),
            config: self.config.clone(),
            registry: self.registry.clone(),
            shutdown: self.shutdown.clone(),
            connections: self.connections.clone(),
            slots: self
                .config
                .max_connections
                .map(|max| Arc::new(Semaphore::new(max))),
        });

        let app = Router::new()
            .route("/", get(ws_upgrade_handler::<H>))
            .route("/ws", get(ws_upgrade_handler::<H>))
            .route("/health", get(health_handler::<H>))
            .with_state(state);

        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
            if let Err(e) = result {
                error!("Accept loop failed: {e}");
            }
        });

        self.handle = Some(handle);
        self.local_addr = Some(local_addr);
        self.state = ServerState::Running;
        info!("WebSocket gateway listening on ws://{local_addr}");
        Ok(local_addr)
    }

    /// Close every connection, clear the registry, and stop accepting.
    ///
    /// Per-connection close failures are logged and otherwise ignored.
    /// Calling `stop` on a server that is not running does nothing.
    pub async fn stop(&mut self) {
        if matches!(self.state, ServerState::Stopped | ServerState::Stopping) {
            return;
        }
        self.state = ServerState::Stopping;
        info!(sessions = self.registry.active_count(), "Stopping WebSocket gateway");

        let mut close_errors = Vec::new();
        for conn in self.registry.connections() {
            if let Err(e) = conn.close(CLOSE_GOING_AWAY, "Server shutting down") {
                close_errors.push((conn.id(), e));
            }
        }
        if !close_errors.is_empty() {
            for (id, e) in &close_errors {
                debug!(connection_id = %id, "close failed: {e}");
            }
            warn!(failed = close_errors.len(), "Some connections could not be closed cleanly");
        }

        self.shutdown.cancel();
        self.registry.clear();

        self.connections.close();
        if tokio::time::timeout(self.config.close_timeout, self.connections.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.connections.len(),
                "Connection tasks still running after {:?}", self.config.close_timeout
            );
        }

        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }

        self.local_addr = None;
        self.state = ServerState::Stopped;
        info!("WebSocket gateway stopped");
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bound port while running, 0 otherwise.
    pub fn port(&self) -> u16 {
        self.local_addr.map(|a| a.port()).unwrap_or(0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn ws_upgrade_handler<H: MessageHandler>(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState<H>>>,
) -> Response {
    // Reserve a slot before upgrading; it is held until the connection ends
    let slot = match &state.slots {
        Some(slots) => match slots.clone().try_acquire_owned() {
            Ok(permit) => Some(permit),
            Err(_) => {
                let max = state.config.max_connections.unwrap_or_default();
                warn!("Connection from {remote_addr} rejected: max connections reached ({max})");
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
        },
        None => None,
    };

    let tracker = state.connections.clone();
    ws.on_upgrade(move |socket| {
        tracker.track_future(handle_ws_connection(socket, remote_addr, state, slot))
    })
    .into_response()
}

async fn health_handler<H: MessageHandler>(
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "sessions": state.registry.active_count(),
        "connections": state.connections.len(),
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket Connection Handler
// ─────────────────────────────────────────────────────────────────────────────

/// Removes the session however the connection task ends, including when
/// the task itself is dropped.
struct SessionGuard<'a> {
    registry: &'a SessionRegistry,
    conn_id: ConnectionId,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.registry.deregister(self.conn_id);
    }
}

async fn handle_ws_connection<H: MessageHandler>(
    socket: WebSocket,
    remote_addr: SocketAddr,
    state: Arc<AppState<H>>,
    slot: Option<OwnedSemaphorePermit>,
) {
    let config = &state.config;
    let (conn, outbound_rx) =
        ClientConnection::open(remote_addr, config.outbound_buffer, state.shutdown.child_token());
    let client_ip = conn.client_ip();
    let (ws_tx, mut ws_rx) = socket.split();

    let writer = tokio::spawn(run_writer(
        ws_tx,
        outbound_rx,
        conn.clone(),
        config.ping_interval,
        config.ping_timeout,
        config.close_timeout,
    ));

    if !config.allow_from.permits(client_ip) {
        warn!(%client_ip, "WebSocket connection rejected (not in allowFrom list)");
        // Rejected sockets never count against the limit
        drop(slot);
        let _ = conn.close(CLOSE_POLICY_VIOLATION, "Unauthorized");
        finish_writer(writer, config.close_timeout).await;
        return;
    }

    if state.shutdown.is_cancelled() {
        drop(slot);
        let _ = conn.close(CLOSE_GOING_AWAY, "Server shutting down");
        finish_writer(writer, config.close_timeout).await;
        return;
    }

    let session_id = match state.registry.register(conn.clone()) {
        Ok(id) => id,
        Err(e) => {
            error!(%client_ip, "Failed to register session: {e}");
            conn.abort();
            finish_writer(writer, config.close_timeout).await;
            return;
        }
    };
    let guard = SessionGuard {
        registry: &state.registry,
        conn_id: conn.id(),
    };

    info!(%session_id, %client_ip, connection_id = %conn.id(), "New WebSocket connection");

    if let Err(e) = state.handler.on_connect(&conn, &session_id).await {
        error!(%session_id, "Failed to send welcome: {e}");
        drop(guard);
        conn.abort();
        finish_writer(writer, config.close_timeout).await;
        return;
    }

    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            () = conn.closed() => {
                debug!(%session_id, "Connection closed by server");
                break;
            }
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                conn.touch();
                state
                    .handler
                    .handle_frame(&conn, &session_id, text.as_str().as_bytes())
                    .await;
            }
            Some(Ok(Message::Binary(data))) => {
                conn.touch();
                state.handler.handle_frame(&conn, &session_id, &data).await;
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                conn.touch();
            }
            Some(Ok(Message::Close(frame))) => {
                let code = frame.as_ref().map(|f| f.code);
                info!(%session_id, %client_ip, ?code, "WebSocket connection closed");
                break;
            }
            None => {
                info!(%session_id, %client_ip, "WebSocket connection closed");
                break;
            }
            Some(Err(e)) => {
                warn!(%session_id, %client_ip, "WebSocket transport error: {e}");
                break;
            }
        }
    }

    drop(guard);
    conn.abort();
    finish_writer(writer, config.close_timeout).await;
    drop(slot);
    debug!(%session_id, age = ?conn.age(), "Session ended");
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn close_message(code: u16, reason: String) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

/// Write one frame, giving up if the connection closes while the socket
/// is backed up. Returns `false` when the writer should stop.
async fn write_frame(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    conn: &ClientConnection,
    message: Message,
) -> bool {
    tokio::select! {
        biased;
        sent = ws_tx.send(message) => match sent {
            Ok(()) => true,
            Err(e) => {
                debug!(connection_id = %conn.id(), "Write failed: {e}");
                conn.abort();
                false
            }
        },
        () = conn.closed() => false,
    }
}

/// Best-effort close frame, bounded by `close_timeout`.
async fn write_close(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    code: u16,
    reason: String,
    close_timeout: Duration,
) {
    let _ = tokio::time::timeout(close_timeout, ws_tx.send(close_message(code, reason))).await;
}

/// Drain the outbound queue to the socket and check liveness.
///
/// Ends after writing a close frame, when the socket fails, when the
/// connection is closed while a write is stuck, or when the client has been
/// silent past `ping_interval + ping_timeout`.
async fn run_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Outgoing>,
    conn: Arc<ClientConnection>,
    ping_interval: Option<Duration>,
    ping_timeout: Duration,
    close_timeout: Duration,
) {
    let mut ticker = ping_interval.filter(|d| !d.is_zero()).map(|every| {
        let mut t = tokio::time::interval_at(Instant::now() + every, every);
        t.set_missed_tick_behavior(MissedTickBehavior::Delay);
        t
    });
    let idle_limit = ticker.as_ref().map(|t| t.period() + ping_timeout);

    loop {
        let ping_tick = async {
            match ticker.as_mut() {
                Some(t) => {
                    t.tick().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            msg = outbound_rx.recv() => match msg {
                Some(Outgoing::Text(text)) => {
                    if !write_frame(&mut ws_tx, &conn, Message::Text(text.into())).await {
                        break;
                    }
                }
                Some(Outgoing::Close { code, reason }) => {
                    write_close(&mut ws_tx, code, reason, close_timeout).await;
                    break;
                }
                None => break,
            },

            () = conn.closed() => {
                write_close(&mut ws_tx, CLOSE_GOING_AWAY, String::new(), close_timeout).await;
                break;
            }

            () = ping_tick => {
                if let Some(limit) = idle_limit {
                    if conn.idle_for() > limit {
                        warn!(connection_id = %conn.id(), "No traffic for {limit:?}, closing connection");
                        conn.abort();
                        write_close(&mut ws_tx, CLOSE_GOING_AWAY, "Ping timeout".into(), close_timeout).await;
                        break;
                    }
                }
                if !write_frame(&mut ws_tx, &conn, Message::Ping(Bytes::new())).await {
                    break;
                }
            }
        }
    }

    let _ = tokio::time::timeout(close_timeout, ws_tx.close()).await;
}

/// Give the writer `close_timeout` to flush, then abort it.
async fn finish_writer(writer: JoinHandle<()>, close_timeout: Duration) {
    let abort = writer.abort_handle();
    if tokio::time::timeout(close_timeout, writer).await.is_err() {
        abort.abort();
    }
}
