//! wsgate transport layer
//!
//! Owns everything that touches a socket:
//! - Listener lifecycle and shutdown sequencing (`TransportServer`)
//! - Origin admission (`AllowFromPolicy`)
//! - Session identity (`SessionRegistry`)
//! - Per-connection receive loop, outbound queue, and liveness pings
//!
//! The transport is decoupled from the application protocol via the
//! `MessageHandler` trait.

pub mod client;
pub mod policy;
pub mod registry;
pub mod server;

pub use client::{ClientConnection, ConnectionId, Outgoing, SendError};
pub use policy::{AllowFromPolicy, PolicyError};
pub use registry::{RegistryError, Session, SessionInfo, SessionRegistry};
pub use server::{MessageHandler, ServerState, TransportConfig, TransportError, TransportServer};
