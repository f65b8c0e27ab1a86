//! Subdomain sessions and their reverse proxies

mod proxy;
mod registry;

pub use proxy::{is_upgrade_request, HttpProxySession};
pub use registry::SessionRegistry;
