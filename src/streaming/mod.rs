//! Server-push progress streaming for tool runs.

mod hub;
mod wrapper;

pub use hub::{Frame, StreamHub, StreamReceiver};
pub use wrapper::StreamingToolWrapper;
