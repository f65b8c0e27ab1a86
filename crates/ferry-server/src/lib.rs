//! ferry-server: Public broker accepting reverse tunnels
//!
//! The broker runs on a publicly reachable host. Agents connect to it over
//! a WebSocket upgrade on the public HTTP(S) listener, authenticate over
//! SSH, and receive a subdomain. Public requests for that subdomain are
//! reverse-proxied back through the agent's tunnel.

pub mod auth;
pub mod error;
pub mod server;
pub mod session;
pub mod state;

pub use error::{BrokerError, ProxyError};
pub use server::Broker;
pub use state::BrokerState;
