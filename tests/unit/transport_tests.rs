//! Unit tests for the RPC transport over an in-process socket pair.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use engine_supervisor::channel::ProcessChannel;
use engine_supervisor::rpc::{
    arg, unknown_method, CallContext, InvokeFuture, RemoteObject, RemoteRef, RpcTransport,
    TransportEvent,
};
use engine_supervisor::AppError;

const WAIT: Duration = Duration::from_secs(5);

/// Object served by the "worker" side of each test.
struct Calculator;

impl RemoteObject for Calculator {
    fn interface(&self) -> &'static str {
        "Calculator"
    }

    fn invoke<'a>(
        &'a self,
        ctx: &'a CallContext,
        method: &'a str,
        args: Vec<Value>,
    ) -> InvokeFuture<'a> {
        Box::pin(async move {
            match method {
                "add" => {
                    let a: i64 = arg(&args, 0, method)?;
                    let b: i64 = arg(&args, 1, method)?;
                    Ok(json!(a + b))
                }
                "divide" => {
                    let a: i64 = arg(&args, 0, method)?;
                    let b: i64 = arg(&args, 1, method)?;
                    if b == 0 {
                        return Err(AppError::Remote("division by zero".into()));
                    }
                    Ok(json!(a / b))
                }
                "memory" => Ok(json!(ctx.export(Arc::new(Memory)))),
                "report" => {
                    let listener: RemoteRef = arg(&args, 0, method)?;
                    ctx.remote(listener).call("onValue", vec![json!(42)]).await
                }
                "hang" => {
                    std::future::pending::<()>().await;
                    Ok(Value::Null)
                }
                other => Err(unknown_method(self.interface(), other)),
            }
        })
    }
}

struct Memory;

impl RemoteObject for Memory {
    fn interface(&self) -> &'static str {
        "Memory"
    }

    fn invoke<'a>(
        &'a self,
        _ctx: &'a CallContext,
        method: &'a str,
        _args: Vec<Value>,
    ) -> InvokeFuture<'a> {
        Box::pin(async move {
            match method {
                "recall" => Ok(json!(7)),
                other => Err(unknown_method(self.interface(), other)),
            }
        })
    }
}

/// Listener exported by the calling side.
struct Recorder {
    seen: Mutex<Vec<Value>>,
}

impl RemoteObject for Recorder {
    fn interface(&self) -> &'static str {
        "Recorder"
    }

    fn invoke<'a>(
        &'a self,
        _ctx: &'a CallContext,
        method: &'a str,
        args: Vec<Value>,
    ) -> InvokeFuture<'a> {
        Box::pin(async move {
            match method {
                "onValue" => {
                    self.seen.lock().expect("lock").extend(args);
                    Ok(json!("recorded"))
                }
                other => Err(unknown_method(self.interface(), other)),
            }
        })
    }
}

struct Pair {
    client: RpcTransport,
    client_events: mpsc::UnboundedReceiver<TransportEvent>,
    server: RpcTransport,
    calculator: RemoteRef,
}

fn pair() -> Pair {
    let (a, b) = UnixStream::pair().expect("pair");
    let (client_channel, client_inbound) = ProcessChannel::open("client", a);
    let (server_channel, server_inbound) = ProcessChannel::open("server", b);
    let (client, client_events) = RpcTransport::new(client_channel, client_inbound);
    let (server, _server_events) = RpcTransport::new(server_channel, server_inbound);
    let calculator = server.export(Arc::new(Calculator));
    Pair {
        client,
        client_events,
        server,
        calculator,
    }
}

#[tokio::test]
async fn call_returns_result() {
    let pair = pair();
    let value = pair
        .client
        .call(pair.calculator, "add", vec![json!(2), json!(3)])
        .await
        .expect("add");
    assert_eq!(value, json!(5));
}

#[tokio::test]
async fn concurrent_calls_are_matched_to_their_answers() {
    let pair = pair();
    let calculator = pair.client.handle(pair.calculator);

    let calls = (0..20_i64).map(|i| {
        let calculator = calculator.clone();
        async move { calculator.call_as::<i64>("add", vec![json!(i), json!(i)]).await }
    });
    let results = futures_util::future::join_all(calls).await;

    for (i, result) in (0..20_i64).zip(results) {
        assert_eq!(result.expect("add"), i * 2);
    }
}

#[tokio::test]
async fn method_failure_is_a_remote_error() {
    let pair = pair();
    let err = pair
        .client
        .call(pair.calculator, "divide", vec![json!(1), json!(0)])
        .await
        .expect_err("division by zero");
    assert_eq!(err, AppError::Remote("division by zero".into()));
}

#[tokio::test]
async fn unknown_method_is_a_remote_error() {
    let pair = pair();
    let err = pair
        .client
        .call(pair.calculator, "sqrt", vec![])
        .await
        .expect_err("unknown");
    assert_eq!(err, AppError::Remote("unknown method Calculator.sqrt".into()));
}

#[tokio::test]
async fn unknown_target_is_a_remote_error() {
    let pair = pair();
    let err = pair
        .client
        .call(RemoteRef::new(999), "add", vec![])
        .await
        .expect_err("unknown object");
    assert!(matches!(err, AppError::Remote(ref msg) if msg.contains("999")));
}

#[tokio::test]
async fn returned_reference_is_callable() {
    let pair = pair();
    let memory = pair
        .client
        .handle(pair.calculator)
        .call_remote("memory", vec![])
        .await
        .expect("memory ref");

    assert_ne!(memory.reference(), pair.calculator);
    let value: i64 = memory.call_as("recall", vec![]).await.expect("recall");
    assert_eq!(value, 7);
}

#[tokio::test]
async fn peer_can_call_back_into_an_exported_listener() {
    let pair = pair();
    let recorder = Arc::new(Recorder {
        seen: Mutex::new(Vec::new()),
    });
    let listener = pair.client.export(Arc::clone(&recorder) as Arc<dyn RemoteObject>);

    let value = pair
        .client
        .call(pair.calculator, "report", vec![json!(listener)])
        .await
        .expect("report");

    assert_eq!(value, json!("recorded"));
    assert_eq!(*recorder.seen.lock().expect("lock"), vec![json!(42)]);
}

#[tokio::test]
async fn ready_surfaces_as_an_event() {
    let mut pair = pair();
    pair.server
        .send_ready(pair.calculator)
        .await
        .expect("send ready");

    let event = tokio::time::timeout(WAIT, pair.client_events.recv())
        .await
        .expect("timely")
        .expect("event");
    match event {
        TransportEvent::Ready(root) => assert_eq!(root, pair.calculator),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn local_close_fails_pending_calls() {
    let pair = pair();
    let client = pair.client.clone();
    let target = pair.calculator;
    let in_flight = tokio::spawn(async move { client.call(target, "hang", vec![]).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    pair.client.close("shutting down");

    let err = tokio::time::timeout(WAIT, in_flight)
        .await
        .expect("timely")
        .expect("join")
        .expect_err("disconnected");
    assert_eq!(err, AppError::Disconnected("shutting down".into()));
    assert!(pair.client.is_closed());
}

#[tokio::test]
async fn peer_close_fails_pending_calls() {
    let pair = pair();
    let client = pair.client.clone();
    let target = pair.calculator;
    let in_flight = tokio::spawn(async move { client.call(target, "hang", vec![]).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    pair.server.close("worker gone");

    let err = tokio::time::timeout(WAIT, in_flight)
        .await
        .expect("timely")
        .expect("join")
        .expect_err("disconnected");
    assert!(err.is_disconnected(), "got {err:?}");
}

#[tokio::test]
async fn call_after_close_fails_immediately() {
    let pair = pair();
    pair.client.close("closed by test");

    let err = pair
        .client
        .call(pair.calculator, "add", vec![json!(1), json!(1)])
        .await
        .expect_err("closed");
    assert_eq!(err, AppError::Disconnected("closed by test".into()));
}

#[tokio::test]
async fn close_releases_exported_objects() {
    let pair = pair();
    assert_eq!(pair.server.objects().len(), 1);

    pair.server.close("done");

    assert!(pair.server.objects().is_empty());
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn released_references_leave_the_object_table() {
    let pair = pair();
    let calculator = pair.client.handle(pair.calculator);

    let mut memories = Vec::new();
    for _ in 0..50 {
        memories.push(calculator.call_remote("memory", vec![]).await.expect("memory"));
    }
    assert_eq!(pair.server.objects().len(), 51);

    let last = memories[0].clone();
    for memory in memories {
        memory.release().await.expect("release");
    }

    assert!(wait_until(|| pair.server.objects().len() == 1).await);
    let err = last
        .call("recall", vec![])
        .await
        .expect_err("released object");
    assert!(matches!(err, AppError::Remote(ref msg) if msg.contains("unknown object")));
    let sum = calculator
        .call("add", vec![json!(1), json!(2)])
        .await
        .expect("root still exported");
    assert_eq!(sum, json!(3));
}

#[tokio::test]
async fn abandoned_call_is_forgotten() {
    let pair = pair();

    let outcome = tokio::time::timeout(
        Duration::from_millis(100),
        pair.client.call(pair.calculator, "hang", vec![]),
    )
    .await;

    assert!(outcome.is_err(), "hang must not answer");
    assert_eq!(pair.client.pending_calls(), 0);
    assert!(!pair.client.is_closed());
}

#[tokio::test]
async fn answered_calls_leave_nothing_pending() {
    let pair = pair();
    for i in 0..10 {
        pair.client
            .call(pair.calculator, "add", vec![json!(i), json!(1)])
            .await
            .expect("add");
    }
    assert_eq!(pair.client.pending_calls(), 0);
}

#[tokio::test]
async fn closed_token_fires_when_the_peer_goes_away() {
    let pair = pair();
    let closed = pair.client.closed();
    assert!(!closed.is_cancelled());

    pair.server.close("worker gone");

    tokio::time::timeout(WAIT, closed.cancelled())
        .await
        .expect("client notices the closed channel");
    assert!(pair.server.closed().is_cancelled());
}
