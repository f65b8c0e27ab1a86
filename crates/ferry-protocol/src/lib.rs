//! ferry-protocol: Wire protocol for ferry tunnels
//!
//! This crate defines the control-channel framing used for global requests
//! between the broker and client agents, and the JSON handshake payloads
//! exchanged during the config round trip.

pub mod codec;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod request;

pub use codec::{Frame, FrameCodec};
pub use error::ProtocolError;
pub use frame::{FrameHeader, HEADER_SIZE, MAX_KIND_LEN, MAX_PAYLOAD_SIZE};
pub use handshake::{HandshakeReply, TunnelConfig};
pub use message::{Message, MessageType};
pub use request::RequestId;

/// Version string negotiated as the WebSocket subprotocol.
///
/// Both SSH identification strings embed it as well, so a mismatched peer is
/// rejected at the outer upgrade and again at the SSH banner exchange.
pub const PROTOCOL_VERSION: &str = "ferry-v1";

/// Prefix shared by every ferry protocol version.
///
/// Upgrades carrying this prefix but a different version are logged before
/// falling through to plain HTTP handling.
pub const PROTOCOL_PREFIX: &str = "ferry-";

/// SSH identification string sent by the broker
pub fn server_ssh_id() -> String {
    format!("SSH-2.0-{}-server", PROTOCOL_VERSION)
}

/// SSH identification string sent by the agent
pub fn client_ssh_id() -> String {
    format!("SSH-2.0-{}-client", PROTOCOL_VERSION)
}

/// Global request kinds understood by the broker
pub mod kinds {
    /// First request on every tunnel, carrying a JSON `TunnelConfig`
    pub const CONFIG: &str = "config";
    /// Keepalive, always acknowledged
    pub const PING: &str = "ping";
}
