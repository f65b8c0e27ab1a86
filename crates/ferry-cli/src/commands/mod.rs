//! Subcommand implementations

pub mod client;
pub mod server;

pub use client::ClientArgs;
pub use server::ServerArgs;
