//! Strand protocol -- wire types, message codec, compression.
//!
//! One connection per remote device over a pre-established reliable byte
//! stream (TLS, QUIC, or anything else that delivers ordered bytes).
//! 4-byte big-endian length prefix + serde JSON payload, with optional
//! whole-message LZ4 compression.

use std::time::Duration;

pub mod codec;
pub mod compress;
pub mod messages;

pub use codec::MessageCodec;
pub use compress::Compression;
pub use messages::*;

/// Standard data block size: 128 KiB.
pub const BLOCK_SIZE: usize = 128 * 1024;

/// Largest message size allowed on the wire: 512 MiB.
pub const MAX_MESSAGE_LEN: usize = 512 * 1024 * 1024;

/// Messages whose raw encoding is at least this long are candidates for
/// outbound compression.
pub const COMPRESSION_THRESHOLD: usize = 128;

/// How often we make sure to have sent a message, by triggering pings if
/// necessary. The ping sender ticks at half this interval.
pub const PING_SEND_INTERVAL: Duration = Duration::from_secs(90);

/// The longest we wait for a message from the other side before closing
/// the connection. The ping receiver ticks at half this interval.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lz4 decompression failed: {0}")]
    Decompress(String),
    #[error("decompressed length mismatch: expected {expected}, got {got}")]
    LengthMismatch { expected: usize, got: usize },
    #[error("compressed envelope inside compressed envelope")]
    NestedCompression,
    #[error("refusing to compress an already compressed message")]
    CompressedEnvelope,
}
