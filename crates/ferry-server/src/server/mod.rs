//! Public listener, tunnel acceptance and SSH handling

mod handler;
mod listener;
mod routes;
mod tunnel;
mod upgrade;

pub use handler::TunnelHandler;
pub use listener::Broker;
pub use routes::router;
pub use tunnel::{serve_tunnel, TunnelDialer};
pub use upgrade::{classify_upgrade, UpgradeKind};
