//! Teardown tests: remote close, close races, single close callback.

use std::sync::atomic::Ordering;

use strand_protocol::{Close, Compression, Message};

use strand_peer::ConnectionError;

use crate::harness::{start_connection, ModelEvent, TestConn, EVENT_GUARD};

#[tokio::test]
async fn test_remote_close_carries_reason() {
    let mut t = start_connection(Compression::Never);
    t.handshake().await;

    t.peer
        .send(Message::Close(Close {
            reason: "bye".into(),
        }))
        .await;

    let error = t.wait_closed().await;
    assert!(error.contains("bye"), "unexpected error: {error}");
    assert!(t.conn.closed());
    assert_eq!(t.model.closed_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_close_before_handshake_is_accepted() {
    // Close is valid in any state; the reason still comes through.
    let mut t = start_connection(Compression::Never);

    t.peer
        .send(Message::Close(Close {
            reason: "switching connections".into(),
        }))
        .await;

    let error = t.wait_closed().await;
    assert!(error.contains("switching connections"));
}

#[tokio::test]
async fn test_request_racing_remote_close_returns_closed() {
    let mut t = start_connection(Compression::Never);
    t.handshake().await;

    let conn = t.conn.clone();
    let call = tokio::spawn(async move { conn.request("f", "a", 0, 4, vec![], false).await });

    // Consume the request, then close instead of answering.
    match t.peer.recv().await {
        Message::Request(_) => {}
        other => panic!("expected Request, got {other:?}"),
    }
    t.peer
        .send(Message::Close(Close {
            reason: "bye".into(),
        }))
        .await;

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, ConnectionError::Closed), "got {err:?}");

    let error = t.wait_closed().await;
    assert!(error.contains("bye"));
    assert_eq!(t.model.closed_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_operations_fail_closed_after_teardown() {
    let mut t = start_connection(Compression::Never);
    t.handshake().await;

    t.peer
        .send(Message::Close(Close {
            reason: "done".into(),
        }))
        .await;
    let _ = t.wait_closed().await;

    assert!(matches!(
        t.conn.index("f", vec![]).await,
        Err(ConnectionError::Closed)
    ));
    assert!(matches!(
        t.conn.request("f", "a", 0, 4, vec![], false).await,
        Err(ConnectionError::Closed)
    ));
    assert!(matches!(
        t.conn.cluster_config(crate::harness::cluster_config()).await,
        Err(ConnectionError::Closed)
    ));

    // Statistics still answers with the final totals.
    let stats = t.conn.statistics();
    assert_eq!(stats.in_bytes_total, t.peer.bytes_sent);
}

#[tokio::test]
async fn test_concurrent_faults_one_close_callback() {
    let mut t = start_connection(Compression::Never);
    t.handshake().await;

    // A remote Close message and a torn transport land together.
    t.peer
        .send(Message::Close(Close {
            reason: "first".into(),
        }))
        .await;
    let TestConn {
        conn,
        peer,
        model,
        mut events,
    } = t;
    drop(peer);

    loop {
        let event = tokio::time::timeout(EVENT_GUARD, events.recv())
            .await
            .expect("timed out waiting for close")
            .expect("event channel closed");
        if let ModelEvent::Closed { .. } = event {
            break;
        }
    }
    // Give any racing duty time to also attempt a close.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(model.closed_count.load(Ordering::SeqCst), 1);
    assert!(conn.closed());
}
