//! Newline-delimited framing.
//!
//! IRC allows 512 bytes per line including CRLF; tagged lines may add up to
//! 8191 bytes more. The default limit accepts both.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProtocolError, Result};

/// Default upper bound on an incoming line.
pub const DEFAULT_MAX_LINE: usize = 512 + 8191;

/// Splits a byte stream into lines and writes lines terminated with CRLF.
///
/// Invalid UTF-8 is replaced rather than rejected; plenty of networks still
/// carry Latin-1 text.
#[derive(Debug)]
pub struct LineCodec {
    next_index: usize,
    max_len: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::with_max_len(DEFAULT_MAX_LINE)
    }
}

impl LineCodec {
    /// Codec with a custom limit.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            next_index: 0,
            max_len,
        }
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        match src[self.next_index..].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let line = src.split_to(self.next_index + offset + 1);
                self.next_index = 0;
                if line.len() > self.max_len {
                    return Err(ProtocolError::MessageTooLong {
                        actual: line.len(),
                        limit: self.max_len,
                    });
                }
                let text = String::from_utf8_lossy(&line);
                Ok(Some(text.trim_end_matches(&['\r', '\n'][..]).to_string()))
            }
            None => {
                self.next_index = src.len();
                if src.len() > self.max_len {
                    return Err(ProtocolError::MessageTooLong {
                        actual: src.len(),
                        limit: self.max_len,
                    });
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<()> {
        // Anything after an embedded line break would be a second command.
        let line = line.split(|c| c == '\r' || c == '\n').next().unwrap_or_default();
        dst.reserve(line.len() + 2);
        dst.extend_from_slice(line.as_bytes());
        dst.extend_from_slice(b"\r\n");
        Ok(())
    }
}
