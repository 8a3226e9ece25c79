//! Test harness for in-process strand-peer integration tests.
//!
//! Drives a real `Connection` over an in-memory duplex pipe. The remote
//! half is a scripted peer speaking actual wire frames, and the model is a
//! recording stub that forwards every callback as an event.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::Encoder;

use async_trait::async_trait;
use strand_peer::{Connection, ConnectionError, Model};
use strand_protocol::{
    codec, ClusterConfig, Compression, DeviceId, FileDownloadProgressUpdate, FileInfo, Message,
    MessageCodec, RequestError,
};

/// Guard timeout for events that must arrive. Longer than every protocol
/// timer so paused-clock tests can auto-advance through keepalive ticks.
pub const EVENT_GUARD: Duration = Duration::from_secs(600);

pub fn device_id(seed: u8) -> DeviceId {
    DeviceId([seed; 32])
}

/// A minimal cluster config for handshakes.
pub fn cluster_config() -> ClusterConfig {
    ClusterConfig {
        client_name: "strand-test".into(),
        client_version: "v0.0.0".into(),
        folders: vec![],
        options: vec![],
    }
}

// ============================================================================
// Recording model
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    ClusterConfig { folders: usize },
    Index { folder: String, names: Vec<String> },
    IndexUpdate { folder: String, names: Vec<String> },
    Request { folder: String, name: String, size: usize },
    DownloadProgress { folder: String, updates: usize },
    Closed { error: String },
}

/// Model stub: records every callback and answers requests by filling the
/// buffer with a deterministic offset-based pattern.
pub struct RecordingModel {
    tx: mpsc::UnboundedSender<ModelEvent>,
    pub closed_count: AtomicUsize,
    /// When set, `request` fails with this error instead of filling.
    pub request_error: Mutex<Option<RequestError>>,
}

impl RecordingModel {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ModelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                closed_count: AtomicUsize::new(0),
                request_error: Mutex::new(None),
            }),
            rx,
        )
    }

    /// The pattern `request` writes for a given offset and length.
    pub fn block_pattern(offset: i64, len: usize) -> Vec<u8> {
        (0..len).map(|i| (offset as usize + i) as u8).collect()
    }

    fn emit(&self, event: ModelEvent) {
        let _ = self.tx.send(event);
    }
}

#[async_trait]
impl Model for RecordingModel {
    async fn index(&self, _device: DeviceId, folder: &str, files: Vec<FileInfo>) {
        self.emit(ModelEvent::Index {
            folder: folder.into(),
            names: files.into_iter().map(|f| f.name).collect(),
        });
    }

    async fn index_update(&self, _device: DeviceId, folder: &str, files: Vec<FileInfo>) {
        self.emit(ModelEvent::IndexUpdate {
            folder: folder.into(),
            names: files.into_iter().map(|f| f.name).collect(),
        });
    }

    async fn request(
        &self,
        _device: DeviceId,
        folder: &str,
        name: &str,
        offset: i64,
        _hash: &[u8],
        _from_temporary: bool,
        buf: &mut [u8],
    ) -> Result<(), RequestError> {
        self.emit(ModelEvent::Request {
            folder: folder.into(),
            name: name.into(),
            size: buf.len(),
        });
        if let Some(err) = *self.request_error.lock().unwrap() {
            return Err(err);
        }
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (offset as usize + i) as u8;
        }
        Ok(())
    }

    async fn cluster_config(&self, _device: DeviceId, config: ClusterConfig) {
        self.emit(ModelEvent::ClusterConfig {
            folders: config.folders.len(),
        });
    }

    async fn closed(&self, _device: DeviceId, err: ConnectionError) {
        self.closed_count.fetch_add(1, Ordering::SeqCst);
        self.emit(ModelEvent::Closed {
            error: err.to_string(),
        });
    }

    async fn download_progress(
        &self,
        _device: DeviceId,
        folder: &str,
        updates: Vec<FileDownloadProgressUpdate>,
    ) {
        self.emit(ModelEvent::DownloadProgress {
            folder: folder.into(),
            updates: updates.len(),
        });
    }
}

// ============================================================================
// Scripted remote peer
// ============================================================================

/// The remote end of the pipe. Reads and writes real wire frames.
pub struct RemotePeer {
    read: ReadHalf<DuplexStream>,
    write: WriteHalf<DuplexStream>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl RemotePeer {
    /// Encode and send one message (no outbound compression; tests that
    /// need an envelope build it by hand).
    pub async fn send(&mut self, msg: Message) {
        let mut frame = BytesMut::new();
        MessageCodec.encode(&msg, &mut frame).unwrap();
        self.write.write_all(&frame).await.unwrap();
        self.write.flush().await.unwrap();
        self.bytes_sent += frame.len() as u64;
    }

    /// Send raw bytes, bypassing the codec.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.write.write_all(bytes).await.unwrap();
        self.write.flush().await.unwrap();
        self.bytes_sent += bytes.len() as u64;
    }

    /// Receive the next frame exactly as it appears on the wire; a
    /// compressed envelope is NOT unwrapped.
    pub async fn recv_wire(&mut self) -> Message {
        let payload = self.recv_frame().await;
        serde_json::from_slice(&payload).expect("undecodable frame from connection")
    }

    /// Receive the next logical message, unwrapping a compressed envelope.
    pub async fn recv(&mut self) -> Message {
        let payload = self.recv_frame().await;
        codec::decode_payload(&payload).expect("undecodable frame from connection")
    }

    /// Receive a logical message unless `dur` passes first.
    pub async fn recv_within(&mut self, dur: Duration) -> Option<Message> {
        tokio::time::timeout(dur, self.recv()).await.ok()
    }

    async fn recv_frame(&mut self) -> Vec<u8> {
        let mut header = [0u8; 4];
        self.read.read_exact(&mut header).await.unwrap();
        let len = u32::from_be_bytes(header) as usize;
        let mut payload = vec![0u8; len];
        self.read.read_exact(&mut payload).await.unwrap();
        self.bytes_received += (4 + len) as u64;
        payload
    }
}

// ============================================================================
// Connection under test
// ============================================================================

pub struct TestConn {
    pub conn: Arc<Connection>,
    pub peer: RemotePeer,
    pub model: Arc<RecordingModel>,
    pub events: mpsc::UnboundedReceiver<ModelEvent>,
}

/// Build and start a connection wired to a scripted peer.
pub fn start_connection(compression: Compression) -> TestConn {
    let (local, remote) = tokio::io::duplex(1024 * 1024);
    let (local_read, local_write) = tokio::io::split(local);
    let (remote_read, remote_write) = tokio::io::split(remote);

    let (model, events) = RecordingModel::new();
    let conn = Arc::new(Connection::new(
        device_id(1),
        local_read,
        local_write,
        model.clone(),
        "test-device",
        compression,
    ));
    conn.start();

    TestConn {
        conn,
        peer: RemotePeer {
            read: remote_read,
            write: remote_write,
            bytes_sent: 0,
            bytes_received: 0,
        },
        model,
        events,
    }
}

impl TestConn {
    /// Next model event, guarded so a broken test fails instead of hanging.
    pub async fn next_event(&mut self) -> ModelEvent {
        tokio::time::timeout(EVENT_GUARD, self.events.recv())
            .await
            .expect("timed out waiting for model event")
            .expect("model event channel closed")
    }

    /// Drive the handshake: the peer sends ClusterConfig and we wait for
    /// the model to see it.
    pub async fn handshake(&mut self) {
        self.peer.send(Message::ClusterConfig(cluster_config())).await;
        match self.next_event().await {
            ModelEvent::ClusterConfig { .. } => {}
            other => panic!("expected ClusterConfig event, got {other:?}"),
        }
    }

    /// Wait for the close callback and return its error text.
    pub async fn wait_closed(&mut self) -> String {
        loop {
            if let ModelEvent::Closed { error } = self.next_event().await {
                return error;
            }
        }
    }
}
