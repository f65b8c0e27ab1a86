//! Message types for the ferry control channel
//!
//! The control channel carries SSH-style global requests: out-of-band
//! request/reply exchanges that are not tied to any logical stream.
//!
//! # Message Flow
//!
//! 1. Agent opens the control channel right after authentication
//! 2. Agent sends `Request { kind: "config" }` with a JSON `TunnelConfig`
//! 3. Broker answers with `Reply` carrying a JSON `HandshakeReply`
//! 4. Agent sends `Request { kind: "ping" }` periodically, broker replies `ok`
//!
//! Replies reuse the request id of the request they answer.

use bytes::Bytes;

/// Message type byte carried in the frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Global request
    Request = 0x01,
    /// Reply to a global request
    Reply = 0x02,
}

impl MessageType {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Request),
            0x02 => Some(Self::Reply),
            _ => None,
        }
    }
}

/// Control channel messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Global request
    Request {
        /// Request kind, e.g. `config` or `ping`
        kind: String,
        /// Whether the sender waits for a `Reply`
        want_reply: bool,
        /// Opaque payload, JSON for `config`
        payload: Bytes,
    },

    /// Reply to a global request
    Reply {
        /// Whether the request succeeded
        ok: bool,
        /// Opaque payload, JSON for `config`
        payload: Bytes,
    },
}

impl Message {
    /// Build a request
    pub fn request(kind: impl Into<String>, want_reply: bool, payload: Bytes) -> Self {
        Message::Request {
            kind: kind.into(),
            want_reply,
            payload,
        }
    }

    /// Build a reply
    pub fn reply(ok: bool, payload: Bytes) -> Self {
        Message::Reply { ok, payload }
    }

    /// Get the message type for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Request { .. } => MessageType::Request,
            Message::Reply { .. } => MessageType::Reply,
        }
    }
}
