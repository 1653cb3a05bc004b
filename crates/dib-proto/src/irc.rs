//! [`Message`]-level codec built on [`LineCodec`].

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProtocolError, Result};
use crate::line::LineCodec;
use crate::message::Message;

/// Frames a stream into parsed [`Message`]s.
///
/// Blank and unparseable lines are skipped. A decode error would end a
/// `Framed` stream, and one garbled line from a server is not worth a
/// reconnect.
#[derive(Debug, Default)]
pub struct IrcCodec {
    inner: LineCodec,
}

impl IrcCodec {
    /// Codec with a custom line limit.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            inner: LineCodec::with_max_len(max_len),
        }
    }
}

impl Decoder for IrcCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        loop {
            match self.inner.decode(src)? {
                Some(line) => match line.parse::<Message>() {
                    Ok(msg) => return Ok(Some(msg)),
                    Err(_) => continue,
                },
                None => return Ok(None),
            }
        }
    }
}

impl Encoder<Message> for IrcCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        self.inner.encode(msg.to_string(), dst)
    }
}
