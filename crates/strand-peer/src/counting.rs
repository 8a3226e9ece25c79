//! Byte-counting transport wrappers.
//!
//! Every read and write passes through a `TransferCounter`: a monotonic
//! byte total plus a last-activity stamp. The keepalive supervisors watch
//! the stamps; `Statistics` snapshots the totals. Stamps use
//! `tokio::time::Instant` so paused-clock tests can drive the supervisors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// Shared byte total and last-activity stamp for one direction.
pub struct TransferCounter {
    total: AtomicU64,
    last: Mutex<Instant>,
}

impl TransferCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            total: AtomicU64::new(0),
            last: Mutex::new(Instant::now()),
        })
    }

    fn record(&self, n: usize) {
        self.total.fetch_add(n as u64, Ordering::Relaxed);
        *self.last.lock().expect("counter lock poisoned") = Instant::now();
    }

    /// Total bytes transferred so far.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Instant of the most recent transfer (creation time if none yet).
    pub fn last_activity(&self) -> Instant {
        *self.last.lock().expect("counter lock poisoned")
    }
}

/// Reader half wrapped with a counter.
pub struct CountingReader<R> {
    inner: R,
    counter: Arc<TransferCounter>,
}

impl<R: AsyncRead + Unpin> CountingReader<R> {
    pub fn new(inner: R, counter: Arc<TransferCounter>) -> Self {
        Self { inner, counter }
    }

    /// Fill `buf` completely, counting the bytes on success.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.inner.read_exact(buf).await?;
        self.counter.record(buf.len());
        Ok(())
    }
}

/// Writer half wrapped with a counter.
pub struct CountingWriter<W> {
    inner: W,
    counter: Arc<TransferCounter>,
}

impl<W: AsyncWrite + Unpin> CountingWriter<W> {
    pub fn new(inner: W, counter: Arc<TransferCounter>) -> Self {
        Self { inner, counter }
    }

    /// Write all of `buf` and flush, counting the bytes on success.
    pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(buf).await?;
        self.inner.flush().await?;
        self.counter.record(buf.len());
        Ok(())
    }
}

/// Point-in-time connection statistics.
#[derive(Debug, Clone, Copy)]
pub struct Statistics {
    pub at: SystemTime,
    pub in_bytes_total: u64,
    pub out_bytes_total: u64,
}
