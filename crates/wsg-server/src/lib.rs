//! wsgate server: everything between the transport and the pipeline.
//!
//! The protocol handler decodes frames and answers heartbeats inline,
//! handing user messages to the dispatcher, which runs the pipeline in the
//! background. Replies come back through the outbound router.
//! `WebSocketChannel` composes all of it behind start/stop/send.

pub mod bus;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod handler;
pub mod pipeline;
pub mod router;

pub use bus::{BusReceivers, MessageBus};
pub use channel::{ChannelError, WebSocketChannel};
pub use config::{ChannelConfig, ConfigError};
pub use dispatcher::{DispatchError, Dispatcher};
pub use handler::{DEFAULT_WELCOME, HandleError, ProtocolHandler};
pub use pipeline::{Pipeline, PipelineError};
pub use router::{Delivery, OutboundRouter};
