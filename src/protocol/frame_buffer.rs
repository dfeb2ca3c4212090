//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` and a two-state machine for fragmented frames:
//! waiting for a complete 12-byte header, then waiting for `size` body
//! bytes. The client reader feeds it raw chunks from the child's stdout
//! (seeded with any bytes that arrived alongside the ready sentinel) and
//! drains complete frames.

use bytes::{Bytes, BytesMut};

use super::frame::Message;
use super::wire_format::{Header, HEADER_SIZE};
use crate::error::{Error, Result};

/// Largest body accepted from the peer (1 GB). Anything bigger is treated
/// as a corrupt header.
pub const MAX_BODY_SIZE: u32 = 1_073_741_824;

#[derive(Debug, Clone)]
enum State {
    WaitingForHeader,
    WaitingForBody { header: Header },
}

/// Accumulates incoming bytes and extracts complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
}

impl FrameBuffer {
    /// Create an empty frame buffer.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
        }
    }

    /// Create a frame buffer seeded with bytes already read off the stream.
    pub fn with_leftover(leftover: &[u8]) -> Self {
        let mut buf = Self::new();
        buf.buffer.extend_from_slice(leftover);
        buf
    }

    /// Push raw bytes and extract all complete frames.
    ///
    /// Partial data stays buffered for the next push. Returns an error when
    /// a header announces a body larger than [`MAX_BODY_SIZE`]; that is
    /// fatal for the stream.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Message>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Message>> {
        loop {
            match &self.state {
                State::WaitingForHeader => {
                    if self.buffer.len() < HEADER_SIZE {
                        return Ok(None);
                    }
                    // The buffer has enough bytes for a full header.
                    let header = Header::decode(&self.buffer[..HEADER_SIZE]).unwrap();
                    if header.size > MAX_BODY_SIZE {
                        return Err(Error::Protocol(format!(
                            "frame body of {} bytes exceeds maximum {}",
                            header.size, MAX_BODY_SIZE
                        )));
                    }
                    let _ = self.buffer.split_to(HEADER_SIZE);

                    if header.size == 0 {
                        return Ok(Some(Message::new(header, Bytes::new())));
                    }
                    self.state = State::WaitingForBody { header };
                }

                State::WaitingForBody { header } => {
                    let needed = header.size as usize;
                    if self.buffer.len() < needed {
                        return Ok(None);
                    }
                    let body = self.buffer.split_to(needed).freeze();
                    let header = *header;
                    self.state = State::WaitingForHeader;
                    return Ok(Some(Message::new(header, body)));
                }
            }
        }
    }

    /// Number of buffered bytes not yet assembled into a frame.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer holds no pending bytes.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
