//! Keepalive supervisor tests under a paused clock.
//!
//! The ping sender ticks every 45s and fires when the write side has been
//! idle for at least that long; the receiver ticks every 150s and closes
//! after 300s of inbound silence.

use std::sync::atomic::Ordering;
use std::time::Duration;

use strand_protocol::{Compression, Message};

use crate::harness::start_connection;

#[tokio::test(start_paused = true)]
async fn test_idle_connection_pings_then_stays_quiet() {
    let mut t = start_connection(Compression::Never);
    t.handshake().await;

    // Nothing has been written locally; the first sender tick finds the
    // write side idle and injects a ping.
    tokio::time::advance(Duration::from_secs(46)).await;
    let msg = t.peer.recv_within(Duration::from_millis(100)).await;
    assert_eq!(msg, Some(Message::Ping));

    // Short of the next tick there is nothing more on the wire.
    tokio::time::advance(Duration::from_secs(43)).await;
    let msg = t.peer.recv_within(Duration::from_millis(100)).await;
    assert_eq!(msg, None);
}

#[tokio::test(start_paused = true)]
async fn test_write_activity_suppresses_ping() {
    let mut t = start_connection(Compression::Never);
    t.handshake().await;

    // Keep the write side warm just before the tick.
    tokio::time::advance(Duration::from_secs(30)).await;
    t.conn.index("default", vec![]).await.unwrap();
    let _ = t.peer.recv().await;

    // Tick at 45s sees only 15s of idle time: no ping.
    tokio::time::advance(Duration::from_secs(16)).await;
    let msg = t.peer.recv_within(Duration::from_millis(100)).await;
    assert_eq!(msg, None);
}

#[tokio::test(start_paused = true)]
async fn test_receive_timeout_closes_connection() {
    let mut t = start_connection(Compression::Never);
    t.handshake().await;

    // Total inbound silence. The receiver ticks at 150s/300s/450s; the
    // first tick that sees more than 300s of idle time closes.
    let error = t.wait_closed().await;
    assert!(error.contains("timeout"), "unexpected error: {error}");
    assert!(t.conn.closed());
    assert_eq!(t.model.closed_count.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_inbound_traffic_defers_timeout() {
    let mut t = start_connection(Compression::Never);
    t.handshake().await;

    // Pings every 100s keep the read side fresh across several receiver
    // ticks.
    for _ in 0..4 {
        tokio::time::advance(Duration::from_secs(100)).await;
        t.peer.send(Message::Ping).await;
        // Let the reader consume it before advancing further.
        tokio::task::yield_now().await;
    }
    assert!(!t.conn.closed());
    assert_eq!(t.model.closed_count.load(Ordering::SeqCst), 0);
}
