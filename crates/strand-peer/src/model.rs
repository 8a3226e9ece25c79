//! Model callback surface.
//!
//! The model is whatever sits behind the connection: the index database and
//! file store on a real node, a recording stub in tests. The connection
//! calls in; it never calls out to the transport.

use async_trait::async_trait;

use strand_protocol::{
    ClusterConfig, DeviceId, FileDownloadProgressUpdate, FileInfo, RequestError,
};

use crate::error::ConnectionError;

/// Receiver side of a connection. Implementations must be thread-safe
/// (Send + Sync); the connection invokes these from its own tasks.
#[async_trait]
pub trait Model: Send + Sync + 'static {
    /// An index was received from the remote device.
    async fn index(&self, device: DeviceId, folder: &str, files: Vec<FileInfo>);

    /// An index update was received from the remote device.
    async fn index_update(&self, device: DeviceId, folder: &str, files: Vec<FileInfo>);

    /// The remote device requested a block. Fill `buf` with the block
    /// content at (`folder`, `name`, `offset`); `buf` is already sized to
    /// the requested length. An error is reported back as a response code
    /// and does not affect the connection.
    #[allow(clippy::too_many_arguments)]
    async fn request(
        &self,
        device: DeviceId,
        folder: &str,
        name: &str,
        offset: i64,
        hash: &[u8],
        from_temporary: bool,
        buf: &mut [u8],
    ) -> Result<(), RequestError>;

    /// A cluster configuration message was received.
    async fn cluster_config(&self, device: DeviceId, config: ClusterConfig);

    /// The connection to the remote device was torn down. Invoked exactly
    /// once, with the root-cause error.
    async fn closed(&self, device: DeviceId, err: ConnectionError);

    /// The remote device sent progress updates for files it is downloading.
    async fn download_progress(
        &self,
        device: DeviceId,
        folder: &str,
        updates: Vec<FileDownloadProgressUpdate>,
    );
}
