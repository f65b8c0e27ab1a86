//! Tunnel establishment and reconnection

mod connector;
mod reconnect;

pub use connector::{ActiveTunnel, ClientHandler, Link, TunnelConnector};
pub use reconnect::ExponentialBackoff;
