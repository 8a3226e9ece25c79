//! Wire message types for the block sync protocol.
//!
//! One tagged `Message` enum covers everything the connection exchanges:
//! cluster configuration, folder indexes, block requests/responses,
//! download progress, pings, orderly close, and the compressed envelope.

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Identity
// ============================================================================

/// Opaque identity of a remote device (SHA-256 sized, supplied by the
/// transport layer after certificate verification).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub [u8; 32]);

impl DeviceId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for DeviceId {
    fn from(bytes: [u8; 32]) -> Self {
        DeviceId(bytes)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

// ============================================================================
// Flag sets
// ============================================================================

/// `Request.flags`: the block is read from the temporary copy of the file.
pub const FLAG_FROM_TEMPORARY: u32 = 1;

/// `Folder.flags` bits.
pub const FLAG_FOLDER_READ_ONLY: u32 = 1 << 0;
pub const FLAG_FOLDER_IGNORE_PERMS: u32 = 1 << 1;
pub const FLAG_FOLDER_IGNORE_DELETE: u32 = 1 << 2;
pub const FLAG_FOLDER_DISABLED_TEMP_INDEXES: u32 = 1 << 3;
pub const FLAG_FOLDER_ALL: u32 = (1 << 4) - 1;

/// `Device.flags` bits (per-share).
pub const FLAG_SHARE_TRUSTED: u32 = 1 << 0;
pub const FLAG_SHARE_READ_ONLY: u32 = 1 << 1;
pub const FLAG_SHARE_INTRODUCER: u32 = 1 << 2;
pub const FLAG_SHARE_BITS: u32 = 0x0000_00ff;

// ============================================================================
// Messages
// ============================================================================

/// Everything that can appear on the wire. Exactly one variant per frame;
/// `Compressed` wraps the encoding of any *other* variant (never itself).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    ClusterConfig(ClusterConfig),
    Index(Index),
    IndexUpdate(Index),
    Request(Request),
    Response(Response),
    DownloadProgress(DownloadProgress),
    Ping,
    Close(Close),
    Compressed(CompressedMessage),
}

/// Folder and device membership announcement. Must be the first message on
/// a fresh connection, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub client_name: String,
    pub client_version: String,
    #[serde(default)]
    pub folders: Vec<Folder>,
    #[serde(default)]
    pub options: Vec<OptionEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    #[serde(default)]
    pub devices: Vec<Device>,
    #[serde(default)]
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub max_local_version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionEntry {
    pub key: String,
    pub value: String,
}

/// Initial file listing for a folder, or an incremental update. The
/// connection core only ever inspects `name`; the rest is for the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub folder: String,
    pub files: Vec<FileInfo>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub modified: i64,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub local_version: u64,
    #[serde(default)]
    pub blocks: Vec<BlockInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub size: i32,
    #[serde(with = "base64_bytes")]
    pub hash: Vec<u8>,
}

/// Block read: `size` bytes at `offset` of `folder`/`name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: i32,
    pub folder: String,
    pub name: String,
    pub offset: i64,
    pub size: i32,
    #[serde(with = "base64_bytes")]
    pub hash: Vec<u8>,
    #[serde(default)]
    pub from_temporary: bool,
}

/// Reply to a `Request`, paired by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: i32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub code: i32,
}

/// Progress updates for files the sender is currently downloading.
/// Forwarded verbatim to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub folder: String,
    pub updates: Vec<FileDownloadProgressUpdate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDownloadProgressUpdate {
    pub update_type: u32,
    pub name: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub block_indexes: Vec<i32>,
}

/// Orderly shutdown with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Close {
    pub reason: String,
}

/// Envelope around the encoding of any non-`Compressed` message. `data` is
/// a raw LZ4 block with no length prefix; `uncompressed_length` is the
/// exact decoded size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedMessage {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub uncompressed_length: i32,
}

// ============================================================================
// Response codes
// ============================================================================

/// A per-request failure reported by the remote model via `Response.code`.
/// Does not terminate the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("generic error")]
    Generic,
    #[error("no such file")]
    NoSuchFile,
    #[error("file is invalid")]
    InvalidFile,
}

impl RequestError {
    /// Wire value for this error kind.
    pub fn to_code(self) -> i32 {
        match self {
            RequestError::Generic => 1,
            RequestError::NoSuchFile => 2,
            RequestError::InvalidFile => 3,
        }
    }

    /// Error kind for a wire code. `None` means success (code 0); codes we
    /// don't know about collapse to `Generic` so a newer peer can't kill
    /// the connection with a new code.
    pub fn from_code(code: i32) -> Option<RequestError> {
        match code {
            0 => None,
            2 => Some(RequestError::NoSuchFile),
            3 => Some(RequestError::InvalidFile),
            _ => Some(RequestError::Generic),
        }
    }
}

/// Wire code for a model request result.
pub fn result_to_code(result: &Result<(), RequestError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.to_code(),
    }
}

// ============================================================================
// Serde helpers
// ============================================================================

/// Serialize/deserialize `Vec<u8>` as a base64 string.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
