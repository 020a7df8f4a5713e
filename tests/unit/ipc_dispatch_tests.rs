//! Unit tests for IPC request routing that never spawn a worker.

use std::sync::Arc;

use serde_json::json;

use engine_supervisor::config::GlobalConfig;
use engine_supervisor::ipc::server::{dispatch_request, IpcRequest, IpcResponse};
use engine_supervisor::models::account::Account;
use engine_supervisor::orchestrator::TenantRegistry;
use engine_supervisor::persistence::account_repo::AccountRepo;
use engine_supervisor::persistence::db;

async fn registry(data_root: &std::path::Path) -> TenantRegistry {
    let database = Arc::new(db::connect_memory().await.expect("db"));
    let repo = AccountRepo::new(database);
    repo.insert(&Account::new("alice", "Alice"))
        .await
        .expect("insert");
    TenantRegistry::new(
        Arc::new(GlobalConfig::with_data_root(data_root)),
        Arc::new(repo),
    )
}

fn request(raw: serde_json::Value) -> IpcRequest {
    serde_json::from_value(raw).expect("valid request")
}

#[tokio::test]
async fn is_running_is_false_for_idle_account() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry(dir.path()).await;

    let response = dispatch_request(
        &registry,
        &request(json!({"method": "isRunning", "accountId": "alice"})),
    )
    .await;

    assert!(response.ok);
    assert_eq!(response.data, Some(json!({"running": false})));
}

#[tokio::test]
async fn process_id_is_null_for_idle_account() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry(dir.path()).await;

    let response = dispatch_request(
        &registry,
        &request(json!({"method": "getProcessId", "accountId": "alice"})),
    )
    .await;

    assert_eq!(response.data, Some(json!({"pid": null})));
}

#[tokio::test]
async fn stop_of_idle_account_is_a_no_op() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry(dir.path()).await;

    let response = dispatch_request(
        &registry,
        &request(json!({"method": "stop", "accountId": "alice"})),
    )
    .await;

    assert!(response.ok);
    assert_eq!(response.data, Some(json!({"stopped": false})));
}

#[tokio::test]
async fn stop_all_needs_no_account() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry(dir.path()).await;

    let response = dispatch_request(&registry, &request(json!({"method": "stopAll"}))).await;

    assert!(response.ok);
    assert_eq!(response.data, Some(json!({"stopped": 0})));
}

#[tokio::test]
async fn missing_account_id_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry(dir.path()).await;

    let response = dispatch_request(&registry, &request(json!({"method": "start"}))).await;

    assert_eq!(
        response,
        IpcResponse {
            ok: false,
            data: None,
            error: Some("missing required 'accountId' field".into()),
        }
    );
}

#[tokio::test]
async fn starting_an_unknown_account_reports_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry(dir.path()).await;

    let response = dispatch_request(
        &registry,
        &request(json!({"method": "start", "accountId": "mallory"})),
    )
    .await;

    assert!(!response.ok);
    let error = response.error.expect("error message");
    assert!(error.starts_with("not found:"), "got {error}");
}

#[tokio::test]
async fn delete_removes_account_directories() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry(dir.path()).await;
    let dirs = GlobalConfig::with_data_root(dir.path()).tenant_dirs("alice");
    let cache = dirs.cache_dir.clone();
    std::fs::create_dir_all(&cache).expect("mkdir");
    std::fs::write(cache.join("blob"), b"cached").expect("write");

    let response = dispatch_request(
        &registry,
        &request(json!({"method": "delete", "accountId": "alice"})),
    )
    .await;

    assert!(response.ok, "{response:?}");
    assert_eq!(response.data, Some(json!({"deleted": "alice"})));
    assert!(!dirs.working_dir.exists());
}

#[tokio::test]
async fn delete_rejects_path_like_ids() {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = registry(dir.path()).await;

    let response = dispatch_request(
        &registry,
        &request(json!({"method": "delete", "accountId": ".."})),
    )
    .await;

    assert!(!response.ok);
    assert!(dir.path().exists());
}

#[test]
fn unknown_methods_do_not_parse() {
    let parsed = serde_json::from_value::<IpcRequest>(json!({"method": "reboot"}));
    assert!(parsed.is_err());
}
