//! Core trait definitions

mod dialer;

pub use dialer::{BoxedStream, StreamDialer, TcpDialer, TunnelIo};
