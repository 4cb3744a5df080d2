// SPDX-License-Identifier: Apache-2.0

//! Response framing
//!
//! Every response unit is length-prefixed:
//!
//! ```text
//! [u32 BE length] [payload: length bytes]
//! ```
//!
//! A payload of exactly one byte equal to [`TERMINATOR`] closes the batch.
//!
//! [`FrameReader`] never blocks. It is meant to be called from a timer: each
//! call drains whatever the socket has buffered and either yields one frame
//! or reports that nothing complete is available yet.

use std::io::{self, Read};

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{EngineError, EngineResult};

/// ASCII Group Separator: terminator payload and end-of-submission marker
pub const TERMINATOR: u8 = 0x1D;

/// Largest payload accepted from the server (256 MiB)
pub const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

const HEADER_LEN: usize = 4;
const READ_CHUNK: usize = 16 * 1024;

/// Outcome of one non-blocking read attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameRead {
    /// No complete frame yet; try again on the next tick
    Pending,
    /// One result payload
    Frame(Bytes),
    /// End of the current batch
    Terminator,
}

/// Incremental, non-blocking frame reader
///
/// Bytes that arrive in pieces are buffered between calls. A frame that has
/// started arriving must make progress by the following call: if a call
/// finds the buffer holding a partial frame, the previous call already saw
/// that same partial frame and no new byte has arrived since, the frame is
/// considered truncated and a `ReadFailure` is returned.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
    /// Set when the last call returned `Pending` with a partial frame buffered
    stalled: bool,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes buffered for the frame currently being assembled
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drops any buffered bytes (used when the underlying socket is replaced)
    pub fn reset(&mut self) {
        self.buf.clear();
        self.stalled = false;
    }

    /// Attempts to read one frame from a non-blocking source.
    ///
    /// `WouldBlock` from the source means "no bytes right now". `Ok(0)` means
    /// the peer closed the stream.
    pub fn poll_frame<R: Read + ?Sized>(&mut self, src: &mut R) -> EngineResult<FrameRead> {
        let mut progressed = false;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            if let Some(frame) = self.split_frame()? {
                self.stalled = false;
                return Ok(frame);
            }

            match src.read(&mut chunk) {
                Ok(0) => {
                    let buffered = self.buf.len();
                    self.reset();
                    return Err(if buffered == 0 {
                        EngineError::read_failure("connection closed by server")
                    } else {
                        EngineError::read_failure(format!(
                            "connection closed mid-frame ({buffered} bytes buffered)"
                        ))
                    });
                }
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    progressed = true;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.buf.is_empty() {
                        self.stalled = false;
                        return Ok(FrameRead::Pending);
                    }
                    if self.stalled && !progressed {
                        let buffered = self.buf.len();
                        self.reset();
                        return Err(EngineError::read_failure(format!(
                            "incomplete frame: no data after {buffered} bytes"
                        )));
                    }
                    self.stalled = true;
                    return Ok(FrameRead::Pending);
                }
                Err(e) => {
                    self.reset();
                    return Err(EngineError::read_failure(e.to_string()));
                }
            }
        }
    }

    /// Splits one complete frame off the front of the buffer, if present.
    fn split_frame(&mut self) -> EngineResult<Option<FrameRead>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if len > MAX_FRAME_LEN {
            self.reset();
            return Err(EngineError::read_failure(format!(
                "frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"
            )));
        }

        let total = HEADER_LEN + len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(len as usize).freeze();

        if is_terminator(&payload) {
            Ok(Some(FrameRead::Terminator))
        } else {
            Ok(Some(FrameRead::Frame(payload)))
        }
    }
}

/// True for the one-byte end-of-batch payload
pub fn is_terminator(payload: &[u8]) -> bool {
    payload == [TERMINATOR]
}

/// Encodes a payload as `[u32 BE length][payload]`.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Encodes the end-of-batch frame.
pub fn encode_terminator() -> Vec<u8> {
    encode_frame(&[TERMINATOR])
}
