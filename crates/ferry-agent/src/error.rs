//! Agent error types

use ferry_core::error::{ConfigError, ControlError};
use ferry_protocol::ProtocolError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Connection errors; only some of them stop the agent
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Server URL cannot be used
    #[error("Invalid server URL '{url}': {message}")]
    InvalidServer { url: String, message: String },

    /// Agent configuration cannot be used
    #[error("Invalid agent config: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// Authentication was rejected by the broker
    #[error("Authentication rejected by broker")]
    AuthRejected,

    /// Host key verification failed
    #[error("Host key verification failed: {message}")]
    HostKeyRejected { message: String },

    /// The broker refused the tunnel config
    #[error("Config rejected by broker: {0}")]
    ConfigRejected(String),

    /// Too many consecutive failed attempts
    #[error("Giving up after {attempts} failed connection attempts")]
    RetriesExhausted { attempts: u32 },

    /// WebSocket dial failed
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Control channel failed
    #[error("Control channel error: {0}")]
    Control(#[from] ControlError),

    /// Malformed payload from the broker
    #[error("Invalid response from server: {0}")]
    Protocol(#[from] ProtocolError),

    /// A connection phase took too long
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Other connection error
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ConnectionError {
    /// Whether retrying cannot help
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionError::InvalidServer { .. }
                | ConnectionError::InvalidConfig(_)
                | ConnectionError::AuthRejected
                | ConnectionError::HostKeyRejected { .. }
                | ConnectionError::RetriesExhausted { .. }
        )
    }
}
