//! Length-delimited message codec for the block sync wire.
//!
//! Wire format: 4-byte big-endian length prefix + serde JSON payload.
//! Inbound compressed envelopes are unwrapped transparently; outbound
//! compression is the writer's decision (see `compress::maybe_compress`)
//! and happens before the message reaches the encoder.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::compress;
use crate::messages::Message;
use crate::{ProtocolError, MAX_MESSAGE_LEN};

/// Length prefix size in bytes.
const LENGTH_PREFIX_SIZE: usize = 4;

/// Decode one message payload (the bytes after the length prefix),
/// unwrapping a compressed envelope if present.
pub fn decode_payload(bytes: &[u8]) -> Result<Message, ProtocolError> {
    let message: Message = serde_json::from_slice(bytes)?;
    if let Message::Compressed(envelope) = message {
        return compress::decompress(&envelope);
    }
    Ok(message)
}

/// Codec for framing Message values over a byte stream.
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least the length prefix
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        // Peek at the length
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_MESSAGE_LEN {
            return Err(ProtocolError::MessageTooLarge {
                size: length,
                max: MAX_MESSAGE_LEN,
            });
        }

        // Check if we have the full message
        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            // Reserve space for the rest
            src.reserve(total - src.len());
            return Ok(None);
        }

        // Consume the length prefix
        src.advance(LENGTH_PREFIX_SIZE);

        // Take the message bytes
        let msg_bytes = src.split_to(length);

        Ok(Some(decode_payload(&msg_bytes)?))
    }
}

impl Encoder<&Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(item)?;

        if payload.len() > MAX_MESSAGE_LEN {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_LEN,
            });
        }

        // Write length prefix + payload
        dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode(&item, dst)
    }
}
