use bytes::Bytes;

use crate::error::{ProtocolError, MAX_FRAME_BODY};
use crate::protocol::message::{Message, MessageKind, FRAME_HEADER_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadMode {
    Header,
    Body,
}

/// Streaming frame reassembly for one connection.
///
/// Feed it raw chunks as they arrive off the socket; it alternates between
/// accumulating the 8-byte header and the declared body, carrying partial
/// frames across chunk boundaries. Completed frames come back in order.
/// Frames with an unknown kind are skipped after a log line; a declared
/// body size above the cap is unrecoverable and surfaces as an error.
#[derive(Debug)]
pub struct FrameReader {
    mode: ReadMode,
    nread: usize,
    header: [u8; FRAME_HEADER_LEN],
    kind_raw: u32,
    body: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            mode: ReadMode::Header,
            nread: 0,
            header: [0; FRAME_HEADER_LEN],
            kind_raw: 0,
            body: Vec::new(),
        }
    }

    pub fn feed(&mut self, mut chunk: &[u8]) -> Result<Vec<Message>, ProtocolError> {
        let mut complete = Vec::new();

        loop {
            match self.mode {
                ReadMode::Header => {
                    let want = FRAME_HEADER_LEN - self.nread;
                    let take = want.min(chunk.len());
                    self.header[self.nread..self.nread + take].copy_from_slice(&chunk[..take]);
                    self.nread += take;
                    chunk = &chunk[take..];

                    if self.nread < FRAME_HEADER_LEN {
                        break;
                    }

                    self.kind_raw = u32::from_le_bytes([
                        self.header[0],
                        self.header[1],
                        self.header[2],
                        self.header[3],
                    ]);
                    let size = u32::from_le_bytes([
                        self.header[4],
                        self.header[5],
                        self.header[6],
                        self.header[7],
                    ]) as usize;

                    if size > MAX_FRAME_BODY {
                        return Err(ProtocolError::OversizeFrame {
                            kind: self.kind_raw,
                            size,
                        });
                    }

                    self.nread = 0;
                    self.body = Vec::with_capacity(size);
                    self.body.resize(size, 0);
                    self.mode = ReadMode::Body;
                }
                ReadMode::Body => {
                    let want = self.body.len() - self.nread;
                    let take = want.min(chunk.len());
                    self.body[self.nread..self.nread + take].copy_from_slice(&chunk[..take]);
                    self.nread += take;
                    chunk = &chunk[take..];

                    if self.nread < self.body.len() {
                        break;
                    }

                    let body = Bytes::from(std::mem::take(&mut self.body));
                    self.nread = 0;
                    self.mode = ReadMode::Header;

                    match MessageKind::from_wire(self.kind_raw) {
                        Some(kind) => complete.push(Message::with_body(kind, body)),
                        None => {
                            tracing::error!(
                                "received message with unknown kind {} ({} byte body), skipping",
                                self.kind_raw,
                                body.len()
                            );
                        }
                    }
                }
            }
        }

        Ok(complete)
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}
