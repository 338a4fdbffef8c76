//! Message framing on the reliable data channel
//!
//! Each frame starts with one byte holding the number of segments that still
//! follow. A message up to [`MAX_SEGMENT_SIZE`] bytes is a single frame with
//! header 0; larger messages are split into segments counting down to 0.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Maximum payload bytes in one frame
pub const MAX_SEGMENT_SIZE: usize = 10_000;

/// Largest message expressible with a one-byte segment counter
pub const MAX_MESSAGE_SIZE: usize = MAX_SEGMENT_SIZE * (u8::MAX as usize + 1);

/// Framing protocol violation. Fails the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("Reassembly error: empty frame")]
    EmptyFrame,

    #[error("Reassembly error: expected segment {expected}, got {got}")]
    UnexpectedSegment { expected: u8, got: u8 },
}

/// Number of frames `len` bytes are split into
pub fn segment_count(len: usize) -> usize {
    len.div_ceil(MAX_SEGMENT_SIZE).max(1)
}

/// Split a message into frames. Callers must check [`MAX_MESSAGE_SIZE`].
pub fn fragment(message: &[u8]) -> Vec<Bytes> {
    let segments = segment_count(message.len());
    debug_assert!(segments <= u8::MAX as usize + 1);

    if message.is_empty() {
        return vec![Bytes::from_static(&[0])];
    }

    message
        .chunks(MAX_SEGMENT_SIZE)
        .enumerate()
        .map(|(i, chunk)| {
            let mut frame = BytesMut::with_capacity(chunk.len() + 1);
            frame.put_u8((segments - 1 - i) as u8);
            frame.put_slice(chunk);
            frame.freeze()
        })
        .collect()
}

/// Per-connection reassembly state, owned by the reliable channel handler
#[derive(Debug, Default)]
pub struct Reassembler {
    buf: BytesMut,
    /// Remaining count carried by the previous frame of an in-flight message
    previous: Option<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a message is partially received
    pub fn in_progress(&self) -> bool {
        self.previous.is_some()
    }

    /// Feed one frame. Returns the message once its last segment arrives.
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<Bytes>, ReassemblyError> {
        let (&count, payload) = frame.split_first().ok_or(ReassemblyError::EmptyFrame)?;

        if let Some(previous) = self.previous {
            let expected = previous - 1;
            if count != expected {
                self.reset();
                return Err(ReassemblyError::UnexpectedSegment {
                    expected,
                    got: count,
                });
            }
        }

        self.buf.extend_from_slice(payload);

        if count == 0 {
            self.previous = None;
            return Ok(Some(self.buf.split().freeze()));
        }

        self.previous = Some(count);
        Ok(None)
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.previous = None;
    }
}
