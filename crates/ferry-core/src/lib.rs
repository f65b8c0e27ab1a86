//! ferry-core: Core abstractions and configuration for ferry
//!
//! This crate provides the shared configuration structures, error types,
//! and the stream plumbing used by both the broker and the agent: the
//! WebSocket frame adapter, the bidirectional pipe, and the global-request
//! control channel that rides inside the SSH connection.

pub mod config;
pub mod error;
pub mod io;
pub mod traits;
pub mod tunnel;
pub mod types;

pub use types::{generate_subdomain, LocalTarget};
