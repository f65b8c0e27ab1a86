//! Control channel and logical stream helpers

mod control;
mod stream;

pub use control::{spawn_control, ControlHandle, GlobalReply, GlobalRequest};
pub use stream::dial_and_bridge;
