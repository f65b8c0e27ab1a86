//! Broker error types

use thiserror::Error;

/// Errors that stop the broker from serving
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Could not bind the public listener
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Could not load the TLS certificate or key
    #[error("TLS configuration error: {0}")]
    Tls(std::io::Error),

    /// Could not load, generate or persist the host key
    #[error("Host key error: {0}")]
    HostKey(String),

    /// I/O error while serving
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-request proxy failures, answered with `502 Bad Gateway`
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Opening a logical stream through the tunnel failed
    #[error("Failed to dial through tunnel: {0}")]
    Dial(std::io::Error),

    /// HTTP exchange with the local service failed
    #[error("Upstream error: {0}")]
    Upstream(#[from] hyper::Error),

    /// Extra header from the tunnel config is not a valid HTTP header
    #[error("Invalid header '{0}'")]
    InvalidHeader(String),
}

/// Reasons a subdomain could not be assigned
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// Every drawn label was already taken
    #[error("No free subdomain after {draws} draws")]
    Exhausted { draws: u32 },
}
