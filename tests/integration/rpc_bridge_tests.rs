//! Remote object bridge between the supervisor and a real worker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use engine_supervisor::rpc::{unknown_method, CallContext, InvokeFuture, RemoteObject};
use engine_supervisor::AppError;

use super::test_helpers::fixture;

/// Supervisor-side listener the engine calls back into.
struct NotificationSink {
    received: Mutex<Vec<Value>>,
}

impl RemoteObject for NotificationSink {
    fn interface(&self) -> &'static str {
        "NotificationSink"
    }

    fn invoke<'a>(
        &'a self,
        _ctx: &'a CallContext,
        method: &'a str,
        args: Vec<Value>,
    ) -> InvokeFuture<'a> {
        Box::pin(async move {
            match method {
                "onNotification" => {
                    self.received.lock().expect("lock").extend(args);
                    Ok(json!("delivered"))
                }
                other => Err(unknown_method(self.interface(), other)),
            }
        })
    }
}

/// Facades returned by a call are themselves callable.
#[tokio::test]
async fn nested_facade_is_callable() {
    let fx = fixture(&["alice"]).await;
    let facades = fx.registry.start("alice").await.expect("start");

    let devices = facades
        .engine
        .call_remote("deviceManager", vec![])
        .await
        .expect("deviceManager");
    let listed = devices.call("list", vec![]).await.expect("list");

    assert_eq!(listed, json!([{ "id": "alice-local", "kind": "local" }]));
    fx.registry.stop_all();
}

/// A released facade is gone from the worker; the engine itself stays.
#[tokio::test]
async fn released_facade_is_dropped_by_the_worker() {
    let fx = fixture(&["alice"]).await;
    let facades = fx.registry.start("alice").await.expect("start");
    let devices = facades
        .engine
        .call_remote("deviceManager", vec![])
        .await
        .expect("deviceManager");
    let stale = devices.clone();

    devices.release().await.expect("release");

    let err = stale.call("list", vec![]).await.expect_err("released");
    assert!(
        matches!(err, AppError::Remote(ref msg) if msg.contains("unknown object")),
        "got {err:?}"
    );
    let pong: String = facades.engine.call_as("ping", vec![]).await.expect("ping");
    assert_eq!(pong, "pong");
    fx.registry.stop_all();
}

/// The assistant facade is independent of the engine facade.
#[tokio::test]
async fn assistant_answers_for_its_account() {
    let fx = fixture(&["alice"]).await;
    let facades = fx.registry.start("alice").await.expect("start");

    let answer: String = facades
        .assistant
        .call_as("ask", vec![json!("status?")])
        .await
        .expect("ask");

    assert_eq!(answer, "alice: status?");
    fx.registry.stop_all();
}

/// The worker can call objects exported by the supervisor.
#[tokio::test]
async fn engine_calls_back_into_the_supervisor() {
    let fx = fixture(&["alice"]).await;
    let facades = fx.registry.start("alice").await.expect("start");

    let sink = Arc::new(NotificationSink {
        received: Mutex::new(Vec::new()),
    });
    let listener = facades
        .engine
        .export(Arc::clone(&sink) as Arc<dyn RemoteObject>);

    let ack = facades
        .engine
        .call("notify", vec![json!(listener), json!({"text": "hi"})])
        .await
        .expect("notify");

    assert_eq!(ack, json!("delivered"));
    assert_eq!(
        *sink.received.lock().expect("lock"),
        vec![json!({ "accountId": "alice", "message": { "text": "hi" } })]
    );
    fx.registry.stop_all();
}

/// Engine-side failures surface as remote errors and leave the worker up.
#[tokio::test]
async fn engine_failure_is_a_remote_error() {
    let fx = fixture(&["alice"]).await;
    let facades = fx.registry.start("alice").await.expect("start");

    let err = facades
        .engine
        .call("fail", vec![json!("disk full")])
        .await
        .expect_err("fail");
    assert_eq!(err, AppError::Remote("disk full".into()));

    let err = facades
        .engine
        .call("selfDestruct", vec![])
        .await
        .expect_err("unknown");
    assert_eq!(err, AppError::Remote("unknown method Engine.selfDestruct".into()));

    assert!(fx.registry.is_running("alice"));
    fx.registry.stop_all();
}

/// A slow call does not hold up other calls on the same channel.
#[tokio::test]
async fn slow_call_does_not_block_others() {
    let fx = fixture(&["alice"]).await;
    let facades = fx.registry.start("alice").await.expect("start");

    let slow = {
        let engine = facades.engine.clone();
        tokio::spawn(async move { engine.call("sleep", vec![json!(1_000)]).await })
    };
    let pong = tokio::time::timeout(
        Duration::from_millis(500),
        facades.engine.call("ping", vec![]),
    )
    .await
    .expect("ping must not wait behind sleep")
    .expect("ping");

    assert_eq!(pong, json!("pong"));
    assert_eq!(slow.await.expect("join").expect("sleep"), json!(1_000));
    fx.registry.stop_all();
}
