//! Unit tests for the process channel adapter over a socket pair.

use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::time::Duration;

use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use engine_supervisor::channel::ProcessChannel;
use engine_supervisor::AppError;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn message_crosses_the_channel() {
    let (a, b) = UnixStream::pair().expect("pair");
    let (left, _left_rx) = ProcessChannel::open("left", a);
    let (_right, mut right_rx) = ProcessChannel::open("right", b);

    left.send(json!({"type": "ready", "root": 1}))
        .await
        .expect("send");

    let inbound = tokio::time::timeout(RECV_TIMEOUT, right_rx.recv())
        .await
        .expect("timely")
        .expect("message");
    assert_eq!(inbound.message, json!({"type": "ready", "root": 1}));
    assert!(inbound.handles.is_empty());
}

#[tokio::test]
async fn messages_arrive_in_order() {
    let (a, b) = UnixStream::pair().expect("pair");
    let (left, _left_rx) = ProcessChannel::open("left", a);
    let (_right, mut right_rx) = ProcessChannel::open("right", b);

    for i in 0..50 {
        left.send(json!({ "seq": i })).await.expect("send");
    }
    for i in 0..50 {
        let inbound = tokio::time::timeout(RECV_TIMEOUT, right_rx.recv())
            .await
            .expect("timely")
            .expect("message");
        assert_eq!(inbound.message["seq"], i);
    }
}

#[tokio::test]
async fn handle_travels_with_its_message() {
    let (a, b) = UnixStream::pair().expect("pair");
    let (left, _left_rx) = ProcessChannel::open("left", a);
    let (_right, mut right_rx) = ProcessChannel::open("right", b);

    let (mut kept, sent) = std::os::unix::net::UnixStream::pair().expect("std pair");
    left.send(json!({"before": true})).await.expect("send");
    left.send_with_handle(json!({"type": "direct", "id": "c1"}), OwnedFd::from(sent))
        .await
        .expect("send with handle");

    let first = right_rx.recv().await.expect("first");
    assert!(first.handles.is_empty(), "handle must not attach to an earlier message");

    let second = tokio::time::timeout(RECV_TIMEOUT, right_rx.recv())
        .await
        .expect("timely")
        .expect("second");
    assert_eq!(second.message["id"], "c1");
    assert_eq!(second.handles.len(), 1);

    let mut received = std::os::unix::net::UnixStream::from(
        second.handles.into_iter().next().expect("handle"),
    );
    received.write_all(b"ping").expect("write through received handle");
    let mut buf = [0_u8; 4];
    kept.read_exact(&mut buf).expect("read on kept end");
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn malformed_lines_are_skipped() {
    let (mut raw, b) = UnixStream::pair().expect("pair");
    let (_right, mut right_rx) = ProcessChannel::open("right", b);

    raw.write_all(b"this is not json\n\n{\"ok\":true}\n")
        .await
        .expect("raw write");

    let inbound = tokio::time::timeout(RECV_TIMEOUT, right_rx.recv())
        .await
        .expect("timely")
        .expect("message");
    assert_eq!(inbound.message, json!({"ok": true}));
}

/// A line that is not valid UTF-8 is dropped without closing the channel.
#[tokio::test]
async fn invalid_utf8_line_is_skipped() {
    let (mut raw, b) = UnixStream::pair().expect("pair");
    let (right, mut right_rx) = ProcessChannel::open("right", b);

    raw.write_all(b"{\"x\":\"\xff\"}\n{\"after\":1}\n")
        .await
        .expect("raw write");

    let inbound = tokio::time::timeout(RECV_TIMEOUT, right_rx.recv())
        .await
        .expect("timely")
        .expect("message");
    assert_eq!(inbound.message, json!({"after": 1}));
    assert!(!right.is_closed());
}

#[tokio::test]
async fn send_after_close_fails_with_channel_closed() {
    let (a, _b) = UnixStream::pair().expect("pair");
    let (channel, _rx) = ProcessChannel::open("left", a);

    channel.close();

    assert!(channel.is_closed());
    let err = channel.send(json!({})).await.expect_err("closed");
    assert_eq!(err, AppError::ChannelClosed);
}

#[tokio::test]
async fn peer_hangup_ends_inbound_stream() {
    let (a, b) = UnixStream::pair().expect("pair");
    let (channel, mut rx) = ProcessChannel::open("left", a);

    drop(b);

    let next = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("inbound must end promptly");
    assert!(next.is_none());
    assert!(channel.is_closed());
}
