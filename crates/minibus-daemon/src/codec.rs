//! [`tokio_util::codec`] adapter over the pure message framer.
//!
//! The peer task cannot use `Framed` directly because descriptors arrive as
//! ancillary data outside the byte stream, so it drives this codec by hand:
//! append received bytes to a `BytesMut`, then call [`Decoder::decode`] until
//! it returns `Ok(None)`. The codec owns no buffers and no state.

use bytes::{Buf, BytesMut};
use minibus_core::framer;
use minibus_core::{Message, WireError};
use tokio_util::codec::{Decoder, Encoder};

/// Stateless message codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl MessageCodec {
    /// Creates the codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = WireError;

    /// Decodes one message from the front of `src`.
    ///
    /// Size declarations are validated against the protocol ceiling before
    /// any buffering decision, so a hostile header cannot make the peer task
    /// accumulate unbounded input.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, WireError> {
        match framer::decode_message(src)? {
            Some((message, consumed)) => {
                src.advance(consumed);
                Ok(Some(message))
            },
            None => Ok(None),
        }
    }
}

impl Encoder<&Message> for MessageCodec {
    type Error = WireError;

    fn encode(&mut self, message: &Message, dst: &mut BytesMut) -> Result<(), WireError> {
        let bytes = framer::encode_message(message)?;
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}
