//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown message type
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Request kind does not fit the header's length byte
    #[error("Request kind too long: {0} bytes")]
    KindTooLong(usize),

    /// Header fields contradict each other or the frame body
    #[error("Invalid frame: {0}")]
    InvalidFrame(&'static str),

    /// Handshake payload was not valid JSON for the expected type
    #[error("Invalid handshake payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
