//! ferry-cli: Command-line interface for ferry
//!
//! Provides the `ferry` binary with `server` and `client` subcommands.
//! Flags are turned into the config structs read by the broker and the
//! agent; process signals drive shutdown and reload.

pub mod commands;
pub mod signals;
