use crate::protocol::message::{Message, FRAME_HEADER_LEN};

/// Per-connection send buffer capacity. A couple of MTU-sized packets'
/// worth; the flush monitor bounds how long bytes can sit here.
pub const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Fixed-capacity write batching for one connection.
///
/// Frames are appended back to back; whenever an append would overflow the
/// buffer, the current contents are handed to `spill` first. Bodies larger
/// than the whole buffer stream through it in capacity-sized pieces. The
/// buffer itself never reallocates past its capacity, and frame bytes are
/// emitted strictly in append order.
#[derive(Debug)]
pub struct WriteBuffer {
    buf: Vec<u8>,
    capacity: usize,
    /// Set by every flush; the flush monitor clears it each tick to tell
    /// "flushed already this tick" apart from "idle".
    pub flushed: bool,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::with_capacity(WRITE_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > FRAME_HEADER_LEN);
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            flushed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Drop buffered bytes after the caller has written them out.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.flushed = true;
    }

    /// Append one frame, spilling full buffers through `spill`.
    pub fn append(&mut self, msg: &Message, spill: &mut dyn FnMut(&[u8])) {
        if self.buf.len() + FRAME_HEADER_LEN > self.capacity {
            spill(&self.buf);
            self.clear();
        }
        self.buf.extend_from_slice(&msg.header_bytes());

        let mut body = &msg.body[..];
        loop {
            let space = self.capacity - self.buf.len();
            if body.len() <= space {
                self.buf.extend_from_slice(body);
                break;
            }
            self.buf.extend_from_slice(&body[..space]);
            body = &body[space..];
            spill(&self.buf);
            self.clear();
        }
    }
}

impl Default for WriteBuffer {
    fn default() -> Self {
        Self::new()
    }
}
