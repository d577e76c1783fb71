//! Envelope `type` tag constants.
//!
//! Every frame on the wire is a JSON object whose `type` field names one of
//! these. Inbound tags are sent by browser clients; outbound tags by the
//! gateway.

/// All envelope type names, grouped by direction.
pub struct MessageTypes;

impl MessageTypes {
    // ── Client → server ─────────────────────────────────────────────────
    pub const USER_MESSAGE: &str = "user_message";
    pub const PING: &str = "ping";

    // ── Server → client ─────────────────────────────────────────────────
    pub const STATUS: &str = "status";
    pub const PONG: &str = "pong";
    pub const ERROR: &str = "error";
    pub const AGENT_RESPONSE: &str = "agent_response";
}

/// Type alias for envelope type names.
pub type MessageType = &'static str;

/// Channel name stamped on every [`InboundMessage`](crate::InboundMessage).
pub const CHANNEL_NAME: &str = "websocket";

/// Close code sent when a remote address is outside the allowlist.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Close code sent to every client when the server shuts down.
pub const CLOSE_GOING_AWAY: u16 = 1001;
