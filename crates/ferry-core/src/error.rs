//! Core error types for ferry

use ferry_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the global-request control channel
#[derive(Error, Debug)]
pub enum ControlError {
    /// The control channel closed before the reply arrived
    #[error("Control channel closed")]
    Closed,

    /// The peer sent something that is not a valid control frame
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Errors parsing `host:port` targets and header flags
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TargetError {
    /// Target is not `PORT`, `:PORT` or `HOST:PORT`
    #[error("Invalid local address '{0}'")]
    InvalidLocal(String),

    /// Port is outside 1..65535
    #[error("Invalid port '{0}'")]
    InvalidPort(String),

    /// Header flag is not `NAME=VALUE`
    #[error("Invalid header '{0}', expected NAME=VALUE")]
    InvalidHeader(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
