//! Line framing for process channels.
//!
//! Frames are raw bytes up to `\n`. Text decoding is left to the JSON
//! parser, so a line that is not valid UTF-8 is rejected like any other
//! malformed message instead of failing the stream.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::{AppError, Result};

/// Maximum line length accepted on a process channel: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Splits inbound bytes into lines of at most [`MAX_LINE_BYTES`].
///
/// An oversized line yields one [`AppError::Channel`]; its remaining bytes
/// are dropped and framing resumes after its newline.
#[derive(Debug, Default)]
pub struct LineFramer {
    /// Bytes of the buffer already searched for a newline.
    scanned: usize,
    /// Inside an oversized line whose tail is being dropped.
    discarding: bool,
}

impl LineFramer {
    /// Create a framer with an empty scan position.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for LineFramer {
    type Item = BytesMut;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        loop {
            let newline = src[self.scanned..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.scanned + offset);

            match (self.discarding, newline) {
                (true, Some(end)) => {
                    src.advance(end + 1);
                    self.scanned = 0;
                    self.discarding = false;
                }
                (true, None) => {
                    src.advance(src.len());
                    self.scanned = 0;
                    return Ok(None);
                }
                (false, Some(end)) => {
                    self.scanned = 0;
                    let mut line = src.split_to(end + 1);
                    line.truncate(end);
                    if line.last() == Some(&b'\r') {
                        line.truncate(end - 1);
                    }
                    if line.len() > MAX_LINE_BYTES {
                        return Err(too_long());
                    }
                    return Ok(Some(line));
                }
                (false, None) if src.len() > MAX_LINE_BYTES => {
                    src.advance(src.len());
                    self.scanned = 0;
                    self.discarding = true;
                    return Err(too_long());
                }
                (false, None) => {
                    self.scanned = src.len();
                    return Ok(None);
                }
            }
        }
    }
}

fn too_long() -> AppError {
    AppError::Channel(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
}
