//! Byte-stream adapters shared by broker and agent

mod frame_adapter;
mod pipe;

pub use frame_adapter::FrameAdapter;
pub use pipe::{pipe, PipeStats};
