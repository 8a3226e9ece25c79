//! Outbound compression policy and LZ4 envelope handling.
//!
//! The wire carries raw LZ4 blocks: no length prefix on `data`, the exact
//! decoded size travels in `uncompressed_length` instead. Inbound
//! decompression is unconditional; the outbound side is governed by the
//! connection's configured policy.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::messages::{CompressedMessage, Message};
use crate::{ProtocolError, COMPRESSION_THRESHOLD};

/// When to compress outbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Never compress.
    Never,
    /// Compress large enough messages, except block responses (default).
    #[default]
    Metadata,
    /// Compress all large enough messages.
    Always,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Never => "never",
            Compression::Metadata => "metadata",
            Compression::Always => "always",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "never" => Ok(Compression::Never),
            "metadata" => Ok(Compression::Metadata),
            "always" => Ok(Compression::Always),
            other => Err(format!("unknown compression policy: {other}")),
        }
    }
}

/// Apply the outbound policy to `msg`. Returns the envelope to send instead
/// of `msg`, or `None` when `msg` should go out as-is. Passing an already
/// compressed message is a programming error.
pub fn maybe_compress(
    policy: Compression,
    msg: &Message,
) -> Result<Option<Message>, ProtocolError> {
    if matches!(msg, Message::Compressed(_)) {
        return Err(ProtocolError::CompressedEnvelope);
    }
    if policy == Compression::Never {
        return Ok(None);
    }

    let raw = serde_json::to_vec(msg)?;
    let compress = match policy {
        Compression::Never => false,
        Compression::Always => raw.len() >= COMPRESSION_THRESHOLD,
        // Block responses are mostly incompressible payload; skip them.
        Compression::Metadata => {
            raw.len() >= COMPRESSION_THRESHOLD && !matches!(msg, Message::Response(_))
        }
    };
    if !compress {
        return Ok(None);
    }

    let data = lz4_flex::block::compress(&raw);
    Ok(Some(Message::Compressed(CompressedMessage {
        data,
        uncompressed_length: raw.len() as i32,
    })))
}

/// Unwrap a compressed envelope into the message it carries. The decoded
/// size must match `uncompressed_length` exactly, and the payload must not
/// be another envelope.
pub fn decompress(envelope: &CompressedMessage) -> Result<Message, ProtocolError> {
    let expected = envelope.uncompressed_length.max(0) as usize;
    let raw = lz4_flex::block::decompress(&envelope.data, expected)
        .map_err(|e| ProtocolError::Decompress(e.to_string()))?;
    if raw.len() != expected {
        return Err(ProtocolError::LengthMismatch {
            expected,
            got: raw.len(),
        });
    }

    let msg: Message = serde_json::from_slice(&raw)?;
    if matches!(msg, Message::Compressed(_)) {
        return Err(ProtocolError::NestedCompression);
    }
    Ok(msg)
}
