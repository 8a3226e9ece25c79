//! The per-device connection.
//!
//! Four long-lived duties per connection, all observing one cancellation
//! token:
//!   1. Reader loop -- parse frames, enforce the handshake state machine,
//!      dispatch per message type
//!   2. Writer loop -- drain the outbox, compress per policy, write frames
//!   3. Ping sender -- keep the write side warm
//!   4. Ping receiver -- close on receive timeout
//!
//! Any failure in a duty tears the whole connection down exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;

use strand_protocol::{
    codec, compress, ClusterConfig, Compression, DeviceId, DownloadProgress,
    FileDownloadProgressUpdate, FileInfo, Index, Message, MessageCodec, Request, RequestError,
    Response, BLOCK_SIZE, MAX_MESSAGE_LEN, PING_SEND_INTERVAL, RECEIVE_TIMEOUT,
};

use crate::counting::{CountingReader, CountingWriter, Statistics, TransferCounter};
use crate::error::ConnectionError;
use crate::model::Model;
use crate::pool::BlockPool;

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Handshake phase of the reader loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    Ready,
}

/// One outbox entry. `drained` (when present) receives the response payload
/// back after the writer has committed the bytes to the transport, so the
/// producer can recycle the buffer.
struct OutboundItem {
    msg: Message,
    drained: Option<oneshot::Sender<Vec<u8>>>,
}

/// Transport halves and outbox receiver, parked until `start`.
struct IoParts {
    reader: CountingReader<BoxReader>,
    writer: CountingWriter<BoxWriter>,
    outbox_rx: mpsc::Receiver<OutboundItem>,
}

/// A protocol connection to one remote device over a pre-established
/// reliable byte stream.
pub struct Connection {
    inner: Arc<RawConnection>,
    io: Mutex<Option<IoParts>>,
}

struct RawConnection {
    id: DeviceId,
    name: String,
    model: Arc<dyn Model>,
    read_counter: Arc<TransferCounter>,
    write_counter: Arc<TransferCounter>,
    /// Waiter registry: request ID -> delivery slot for (data, code).
    /// Held only for O(1) operations, never across I/O.
    awaiting: Mutex<HashMap<i32, oneshot::Sender<(Vec<u8>, i32)>>>,
    next_id: AtomicI32,
    outbox: mpsc::Sender<OutboundItem>,
    closed: CancellationToken,
    close_done: AtomicBool,
    pool: BlockPool,
    compression: Compression,
    /// Serializes Index/IndexUpdate so enqueue order equals send order.
    index_lock: tokio::sync::Mutex<()>,
}

impl Connection {
    /// Create a connection over `reader`/`writer`. Nothing runs until
    /// `start` is called.
    pub fn new<R, W>(
        id: DeviceId,
        reader: R,
        writer: W,
        model: Arc<dyn Model>,
        name: impl Into<String>,
        compression: Compression,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let read_counter = TransferCounter::new();
        let write_counter = TransferCounter::new();
        let (outbox_tx, outbox_rx) = mpsc::channel(1);

        let inner = Arc::new(RawConnection {
            id,
            name: name.into(),
            model,
            read_counter: read_counter.clone(),
            write_counter: write_counter.clone(),
            awaiting: Mutex::new(HashMap::new()),
            next_id: AtomicI32::new(0),
            outbox: outbox_tx,
            closed: CancellationToken::new(),
            close_done: AtomicBool::new(false),
            pool: BlockPool::new(),
            compression,
            index_lock: tokio::sync::Mutex::new(()),
        });

        Self {
            inner,
            io: Mutex::new(Some(IoParts {
                reader: CountingReader::new(Box::new(reader) as BoxReader, read_counter),
                writer: CountingWriter::new(Box::new(writer) as BoxWriter, write_counter),
                outbox_rx,
            })),
        }
    }

    /// Spawn the four connection duties. Must be called exactly once after
    /// construction; later calls are logged no-ops.
    pub fn start(&self) {
        let Some(io) = self.io.lock().expect("io lock poisoned").take() else {
            tracing::debug!(device = %self.inner.id, "start called more than once");
            return;
        };
        let IoParts {
            reader,
            writer,
            outbox_rx,
        } = io;

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let err = inner.clone().reader_loop(reader).await;
            inner.close(err);
        });

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.writer_loop(writer, outbox_rx).await });

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.ping_sender().await });

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.ping_receiver().await });
    }

    /// Identity of the remote device.
    pub fn id(&self) -> DeviceId {
        self.inner.id
    }

    /// Human-readable name of the remote device.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Send the initial file listing for a folder.
    pub async fn index(&self, folder: &str, files: Vec<FileInfo>) -> Result<(), ConnectionError> {
        self.inner
            .send_index(Message::Index(Index {
                folder: folder.into(),
                files,
            }))
            .await
    }

    /// Send an incremental file listing update for a folder.
    pub async fn index_update(
        &self,
        folder: &str,
        files: Vec<FileInfo>,
    ) -> Result<(), ConnectionError> {
        self.inner
            .send_index(Message::IndexUpdate(Index {
                folder: folder.into(),
                files,
            }))
            .await
    }

    /// Fetch a block from the remote device. Blocks until the paired
    /// response arrives or the connection closes.
    pub async fn request(
        &self,
        folder: &str,
        name: &str,
        offset: i64,
        size: usize,
        hash: Vec<u8>,
        from_temporary: bool,
    ) -> Result<Vec<u8>, ConnectionError> {
        self.inner
            .request(folder, name, offset, size, hash, from_temporary)
            .await
    }

    /// Send the cluster configuration message.
    pub async fn cluster_config(&self, config: ClusterConfig) -> Result<(), ConnectionError> {
        if self.inner.send(Message::ClusterConfig(config), None).await {
            Ok(())
        } else {
            Err(ConnectionError::Closed)
        }
    }

    /// Send progress updates for files currently being downloaded.
    pub async fn download_progress(
        &self,
        folder: &str,
        updates: Vec<FileDownloadProgressUpdate>,
    ) -> Result<(), ConnectionError> {
        let msg = Message::DownloadProgress(DownloadProgress {
            folder: folder.into(),
            updates,
        });
        if self.inner.send(msg, None).await {
            Ok(())
        } else {
            Err(ConnectionError::Closed)
        }
    }

    /// Byte totals as of now. Keeps returning the final totals after close.
    pub fn statistics(&self) -> Statistics {
        Statistics {
            at: SystemTime::now(),
            in_bytes_total: self.inner.read_counter.total(),
            out_bytes_total: self.inner.write_counter.total(),
        }
    }

    /// Whether the connection has been torn down.
    pub fn closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }
}

impl RawConnection {
    /// Enqueue a message for the writer. Returns false if the connection
    /// closed before the outbox accepted it.
    async fn send(&self, msg: Message, drained: Option<oneshot::Sender<Vec<u8>>>) -> bool {
        let item = OutboundItem { msg, drained };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => false,
            res = self.outbox.send(item) => res.is_ok(),
        }
    }

    async fn send_index(&self, msg: Message) -> Result<(), ConnectionError> {
        if self.closed.is_cancelled() {
            return Err(ConnectionError::Closed);
        }
        let _guard = self.index_lock.lock().await;
        if self.send(msg, None).await {
            Ok(())
        } else {
            Err(ConnectionError::Closed)
        }
    }

    async fn request(
        &self,
        folder: &str,
        name: &str,
        offset: i64,
        size: usize,
        hash: Vec<u8>,
        from_temporary: bool,
    ) -> Result<Vec<u8>, ConnectionError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = oneshot::channel();
        {
            let mut awaiting = self.awaiting.lock().expect("awaiting lock poisoned");
            let prev = awaiting.insert(id, tx);
            assert!(prev.is_none(), "request id {id} already in flight");
        }

        let sent = self
            .send(
                Message::Request(Request {
                    id,
                    folder: folder.into(),
                    name: name.into(),
                    offset,
                    size: size as i32,
                    hash,
                    from_temporary,
                }),
                None,
            )
            .await;
        if !sent {
            self.awaiting
                .lock()
                .expect("awaiting lock poisoned")
                .remove(&id);
            return Err(ConnectionError::Closed);
        }

        match rx.await {
            Ok((data, code)) => match RequestError::from_code(code) {
                None => Ok(data),
                Some(err) => Err(ConnectionError::Response(err)),
            },
            // Sender dropped: the registry was drained by close.
            Err(_) => Err(ConnectionError::Closed),
        }
    }

    /// Read frames and dispatch until something fails. The returned error
    /// is the close cause.
    async fn reader_loop(self: Arc<Self>, mut reader: CountingReader<BoxReader>) -> ConnectionError {
        // Grows monotonically to the largest message seen.
        let mut buf: Vec<u8> = Vec::new();
        let mut state = State::Initial;

        loop {
            let msg = tokio::select! {
                biased;
                _ = self.closed.cancelled() => return ConnectionError::Closed,
                res = Self::read_message(&mut reader, &mut buf) => match res {
                    Ok(msg) => msg,
                    Err(e) => return e,
                },
            };

            match msg {
                Message::ClusterConfig(config) => {
                    tracing::debug!(device = %self.id, "read ClusterConfig message");
                    if state != State::Initial {
                        return ConnectionError::Protocol(
                            "cluster config message while ready".into(),
                        );
                    }
                    let model = self.model.clone();
                    let id = self.id;
                    tokio::spawn(async move { model.cluster_config(id, config).await });
                    state = State::Ready;
                }

                Message::Index(index) => {
                    if state != State::Ready {
                        return ConnectionError::Protocol(
                            "index message before cluster config".into(),
                        );
                    }
                    tracing::debug!(
                        device = %self.id,
                        folder = index.folder.as_str(),
                        files = index.files.len(),
                        "read Index message"
                    );
                    self.model
                        .index(self.id, &index.folder, filter_index_files(index.files))
                        .await;
                }

                Message::IndexUpdate(index) => {
                    if state != State::Ready {
                        return ConnectionError::Protocol(
                            "index update message before cluster config".into(),
                        );
                    }
                    tracing::debug!(
                        device = %self.id,
                        folder = index.folder.as_str(),
                        files = index.files.len(),
                        "read IndexUpdate message"
                    );
                    self.model
                        .index_update(self.id, &index.folder, filter_index_files(index.files))
                        .await;
                }

                Message::Request(req) => {
                    if state != State::Ready {
                        return ConnectionError::Protocol(
                            "request message before cluster config".into(),
                        );
                    }
                    tracing::debug!(device = %self.id, id = req.id, "read Request message");
                    // Requests are served concurrently so a slow block read
                    // never stalls message reception.
                    let conn = self.clone();
                    tokio::spawn(conn.handle_request(req));
                }

                Message::Response(resp) => {
                    if state != State::Ready {
                        return ConnectionError::Protocol(
                            "response message before cluster config".into(),
                        );
                    }
                    tracing::debug!(device = %self.id, id = resp.id, "read Response message");
                    self.handle_response(resp);
                }

                Message::DownloadProgress(dp) => {
                    if state != State::Ready {
                        return ConnectionError::Protocol(
                            "download progress message before cluster config".into(),
                        );
                    }
                    self.model
                        .download_progress(self.id, &dp.folder, dp.updates)
                        .await;
                }

                Message::Ping => {
                    if state != State::Ready {
                        return ConnectionError::Protocol("ping message before cluster config".into());
                    }
                    // Activity was already recorded by the counting reader.
                }

                Message::Close(close) => {
                    tracing::debug!(device = %self.id, reason = close.reason.as_str(), "read Close message");
                    return ConnectionError::RemoteClose(close.reason);
                }

                Message::Compressed(_) => {
                    // read_message unwraps envelopes; one surviving to here
                    // was nested inside another.
                    return ConnectionError::Protocol(
                        "compressed envelope inside compressed envelope".into(),
                    );
                }
            }
        }
    }

    /// Read one length-prefixed message, unwrapping a compressed envelope
    /// if present.
    async fn read_message(
        reader: &mut CountingReader<BoxReader>,
        buf: &mut Vec<u8>,
    ) -> Result<Message, ConnectionError> {
        // First comes a 32 bit length-of-message word
        let mut header = [0u8; 4];
        reader.read_exact(&mut header).await?;
        let msg_len = u32::from_be_bytes(header) as usize;

        if msg_len > MAX_MESSAGE_LEN {
            return Err(ConnectionError::Protocol(format!(
                "message length {msg_len} exceeds wire limit {MAX_MESSAGE_LEN}"
            )));
        }

        // Then the actual message
        if buf.len() < msg_len {
            buf.resize(msg_len, 0);
        }
        reader.read_exact(&mut buf[..msg_len]).await?;

        Ok(codec::decode_payload(&buf[..msg_len])?)
    }

    /// Serve one incoming block request.
    async fn handle_request(self: Arc<Self>, req: Request) {
        let size = req.size.max(0) as usize;
        let use_pool = size <= BLOCK_SIZE;

        let mut buf = if use_pool {
            let mut buf = self.pool.get();
            buf.truncate(size);
            buf
        } else {
            vec![0; size]
        };

        let result = self
            .model
            .request(
                self.id,
                &req.folder,
                &req.name,
                req.offset,
                &req.hash,
                req.from_temporary,
                &mut buf,
            )
            .await;
        let ok = result.is_ok();
        let code = strand_protocol::result_to_code(&result);

        let data = if ok {
            buf
        } else {
            // Error responses carry no payload; the buffer never enters
            // the outbox and can be recycled right away.
            if use_pool {
                self.pool.put(buf);
            }
            Vec::new()
        };

        let response = Message::Response(Response {
            id: req.id,
            data,
            code,
        });

        if use_pool && ok {
            let (done_tx, done_rx) = oneshot::channel();
            if self.send(response, Some(done_tx)).await {
                // The writer hands the payload back once the bytes have
                // left the transport; only then is the buffer reusable.
                if let Ok(recovered) = done_rx.await {
                    self.pool.put(recovered);
                }
            }
        } else {
            self.send(response, None).await;
        }
    }

    /// Deliver a response to its waiter. Responses nobody is waiting for
    /// are discarded.
    fn handle_response(&self, resp: Response) {
        let mut awaiting = self.awaiting.lock().expect("awaiting lock poisoned");
        match awaiting.remove(&resp.id) {
            Some(slot) => {
                let _ = slot.send((resp.data, resp.code));
            }
            None => {
                tracing::debug!(device = %self.id, id = resp.id, "response with no waiter, discarding");
            }
        }
    }

    /// Drain the outbox, compressing and framing each message in FIFO
    /// order. Exits on close or on the first failure.
    async fn writer_loop(
        &self,
        mut writer: CountingWriter<BoxWriter>,
        mut outbox: mpsc::Receiver<OutboundItem>,
    ) {
        let mut codec = MessageCodec;
        // Grows monotonically to the largest frame written.
        let mut frame = BytesMut::new();

        loop {
            let item = tokio::select! {
                item = outbox.recv() => match item {
                    Some(item) => item,
                    None => return,
                },
                _ = self.closed.cancelled() => return,
            };

            let envelope = match compress::maybe_compress(self.compression, &item.msg) {
                Ok(envelope) => envelope,
                Err(e) => {
                    self.close(e.into());
                    return;
                }
            };
            let wire_msg = envelope.as_ref().unwrap_or(&item.msg);

            frame.clear();
            if let Err(e) = codec.encode(wire_msg, &mut frame) {
                self.close(e.into());
                return;
            }
            if let Err(e) = writer.write_all(&frame).await {
                self.close(ConnectionError::Transport(e));
                return;
            }
            tracing::trace!(device = %self.id, bytes = frame.len(), "wrote frame");

            // Raise the drain signal after the write, handing the payload
            // buffer back to the producer.
            if let Some(done) = item.drained {
                let buf = match item.msg {
                    Message::Response(resp) => resp.data,
                    _ => Vec::new(),
                };
                let _ = done.send(buf);
            }
        }
    }

    /// Make sure a message has been sent within the last PING_SEND_INTERVAL
    /// by injecting pings into quiet periods. Effective cadence lands
    /// between half the interval and the full interval.
    async fn ping_sender(&self) {
        let mut ticker = tokio::time::interval(PING_SEND_INTERVAL / 2);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let idle = self.write_counter.last_activity().elapsed();
                    if idle < PING_SEND_INTERVAL / 2 {
                        tracing::trace!(device = %self.id, ?idle, "ping skipped after write");
                        continue;
                    }
                    tracing::debug!(device = %self.id, ?idle, "sending ping");
                    self.send(Message::Ping, None).await;
                }
                _ = self.closed.cancelled() => return,
            }
        }
    }

    /// Close the connection when nothing has been received for
    /// RECEIVE_TIMEOUT. Any message counts, but in quiet periods we expect
    /// the peer's pings.
    async fn ping_receiver(&self) {
        let mut ticker = tokio::time::interval(RECEIVE_TIMEOUT / 2);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let idle = self.read_counter.last_activity().elapsed();
                    if idle > RECEIVE_TIMEOUT {
                        tracing::debug!(device = %self.id, ?idle, "receive timeout");
                        self.close(ConnectionError::Timeout);
                        return;
                    }
                    tracing::trace!(device = %self.id, ?idle, "last read within timeout");
                }
                _ = self.closed.cancelled() => return,
            }
        }
    }

    /// Single-shot teardown: publish the closed state, cancel every waiter,
    /// notify the model once with the root cause.
    fn close(&self, err: ConnectionError) {
        if self.close_done.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(device = %self.id, error = %err, "closing connection");
        self.closed.cancel();

        // Dropping the delivery slots unblocks every pending request with
        // Closed.
        self.awaiting
            .lock()
            .expect("awaiting lock poisoned")
            .clear();

        let model = self.model.clone();
        let id = self.id;
        tokio::spawn(async move { model.closed(id, err).await });
    }
}

/// Drop obviously invalid file names from an incoming index. Everything
/// else is the model's business. Returns the input vector, touched only
/// when something was dropped.
fn filter_index_files(mut files: Vec<FileInfo>) -> Vec<FileInfo> {
    files.retain(|f| match f.name.as_str() {
        "" | "." | ".." | "/" => {
            tracing::info!(name = %f.name, "dropping invalid filename from incoming index");
            false
        }
        _ => true,
    });
    files
}
