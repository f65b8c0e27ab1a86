//! Agent connection state

use crate::error::ConnectionError;

/// Where the agent is in its connection lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentState {
    /// Between connections, possibly waiting out a backoff delay
    Disconnected,
    /// Dialing the broker
    Connecting {
        /// Consecutive failures so far
        failures: u32,
    },
    /// SSH handshake and authentication
    Handshaking,
    /// Waiting for the reply to the `config` request
    ConfigExchange,
    /// Tunnel established
    Connected {
        /// Public host assigned by the broker
        domain: String,
    },
    /// Terminal state
    Stopped(StopReason),
}

impl AgentState {
    /// Whether the agent has stopped for good
    pub fn is_stopped(&self) -> bool {
        matches!(self, AgentState::Stopped(_))
    }
}

/// Why the agent stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// `close()` was called
    Closed,
    /// The broker rejected the credentials
    AuthRejected,
    /// The broker's host key failed verification
    HostKeyRejected(String),
    /// The configured retry limit was reached
    RetriesExhausted {
        /// Failed attempts made
        attempts: u32,
    },
}

impl StopReason {
    /// `Ok` for a requested stop, the terminal error otherwise
    pub fn into_result(self) -> Result<(), ConnectionError> {
        match self {
            StopReason::Closed => Ok(()),
            StopReason::AuthRejected => Err(ConnectionError::AuthRejected),
            StopReason::HostKeyRejected(message) => {
                Err(ConnectionError::HostKeyRejected { message })
            }
            StopReason::RetriesExhausted { attempts } => {
                Err(ConnectionError::RetriesExhausted { attempts })
            }
        }
    }

    /// Stop reason for a terminal connection error
    pub(crate) fn from_error(err: &ConnectionError) -> Option<Self> {
        match err {
            ConnectionError::AuthRejected => Some(StopReason::AuthRejected),
            ConnectionError::HostKeyRejected { message } => {
                Some(StopReason::HostKeyRejected(message.clone()))
            }
            ConnectionError::RetriesExhausted { attempts } => {
                Some(StopReason::RetriesExhausted { attempts: *attempts })
            }
            _ => None,
        }
    }
}
