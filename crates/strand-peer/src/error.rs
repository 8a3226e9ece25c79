//! Connection-level errors.

use strand_protocol::{ProtocolError, RequestError};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The operation ran after (or during) connection teardown.
    #[error("connection closed")]
    Closed,
    /// Nothing arrived from the remote side within the receive timeout.
    #[error("read timeout")]
    Timeout,
    /// Out-of-phase, unknown or malformed message.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The underlying reader or writer failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    /// Compression or decompression failed.
    #[error("codec error: {0}")]
    Codec(ProtocolError),
    /// The remote side sent an orderly Close; the text is its reason.
    #[error("closed by remote: {0}")]
    RemoteClose(String),
    /// The remote model answered a request with an error code. Does not
    /// terminate the connection.
    #[error(transparent)]
    Response(#[from] RequestError),
}

impl From<ProtocolError> for ConnectionError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => ConnectionError::Transport(e),
            e @ (ProtocolError::Decompress(_) | ProtocolError::LengthMismatch { .. }) => {
                ConnectionError::Codec(e)
            }
            e @ (ProtocolError::MessageTooLarge { .. }
            | ProtocolError::Json(_)
            | ProtocolError::NestedCompression
            | ProtocolError::CompressedEnvelope) => ConnectionError::Protocol(e.to_string()),
        }
    }
}
