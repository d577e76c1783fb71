//! WebSocketChannel: the gateway as one start/stop/send unit.
//!
//! Wires the transport server to a [`ProtocolHandler`] backed by a
//! [`Dispatcher`], and shares the session registry with the
//! [`OutboundRouter`] so pipeline replies reach the right client.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wsg_protocol::OutboundMessage;
use wsg_transport::{ServerState, SessionRegistry, TransportError, TransportServer};

use crate::config::{ChannelConfig, ConfigError};
use crate::dispatcher::Dispatcher;
use crate::handler::ProtocolHandler;
use crate::pipeline::Pipeline;
use crate::router::{Delivery, OutboundRouter};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct WebSocketChannel<P: Pipeline> {
    config: ChannelConfig,
    dispatcher: Arc<Dispatcher<P>>,
    server: TransportServer<ProtocolHandler<P>>,
    router: OutboundRouter,
    /// Stops outbound pumps started by `serve_outbound`
    outbound_stop: CancellationToken,
}

impl<P: Pipeline> WebSocketChannel<P> {
    pub fn new(config: ChannelConfig, pipeline: Arc<P>) -> Result<Self, ChannelError> {
        let transport = config.transport_config()?;
        let registry = Arc::new(SessionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(pipeline));
        let handler = Arc::new(ProtocolHandler::new(dispatcher.clone()));
        let server = TransportServer::with_registry(transport, handler, registry.clone());

        Ok(Self {
            config,
            dispatcher,
            server,
            router: OutboundRouter::new(registry),
            outbound_stop: CancellationToken::new(),
        })
    }

    /// Bind and start serving. Returns `None` when the channel is disabled.
    pub async fn start(&mut self) -> Result<Option<SocketAddr>, ChannelError> {
        if !self.config.enabled {
            warn!("WebSocket channel is disabled in config");
            return Ok(None);
        }

        if self.dispatcher.is_shutting_down() {
            self.dispatcher.reopen();
        }
        if self.outbound_stop.is_cancelled() {
            self.outbound_stop = CancellationToken::new();
        }

        let addr = self.server.start().await?;
        Ok(Some(addr))
    }

    /// Close every connection, then let dispatched messages drain.
    pub async fn stop(&mut self) {
        self.outbound_stop.cancel();
        self.server.stop().await;
        self.dispatcher.shutdown(self.config.drain_timeout()).await;
        info!("WebSocket channel stopped");
    }

    /// Deliver one pipeline reply.
    pub async fn send(&self, message: &OutboundMessage) -> Delivery {
        self.router.send(message).await
    }

    /// Route everything arriving on `outbound` until the queue closes or
    /// the channel stops.
    pub fn serve_outbound(&self, mut outbound: mpsc::Receiver<OutboundMessage>) -> JoinHandle<()> {
        let router = self.router.clone();
        let stop = self.outbound_stop.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    message = outbound.recv() => message,
                    () = stop.cancelled() => break,
                };
                let Some(message) = message else {
                    debug!("Outbound queue closed");
                    break;
                };
                router.send(&message).await;
            }
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn router(&self) -> &OutboundRouter {
        &self.router
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.server.registry()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<P>> {
        &self.dispatcher
    }

    pub fn state(&self) -> ServerState {
        self.server.state()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    pub fn port(&self) -> u16 {
        self.server.port()
    }
}
