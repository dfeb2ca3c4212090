//! Protocol layer: the 12-byte header, frames, and wire constants.

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::Message;
pub use frame_buffer::{FrameBuffer, MAX_BODY_SIZE};
pub use wire_format::{status, Header, HEADER_SIZE};

/// Token written by the server to its real stdout, followed by a newline,
/// to signal that it is ready to read frames from stdin.
pub const READY_SENTINEL: &[u8] = b"_server_started";
