//! ferry-agent: Client agent for ferry tunnels
//!
//! The agent runs next to a private service and keeps one outbound
//! tunnel to a broker open, reconnecting with backoff when it drops.
//! The broker opens a logical stream per proxied connection; the agent
//! bridges each one to the local service.

pub mod agent;
pub mod error;
pub mod state;
pub mod trust;
pub mod tunnel;

pub use agent::{Agent, AgentDialer};
pub use error::ConnectionError;
pub use state::{AgentState, StopReason};
