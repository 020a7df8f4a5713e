//! Bulk startup with a failing tenant in the middle.

use engine_supervisor::AppError;

use super::test_helpers::fixture;

/// One tenant failing to spawn leaves the others reachable.
#[tokio::test]
async fn failing_tenant_does_not_block_the_rest() {
    let fx = fixture(&["alice", "bob", "carol"]).await;
    // A plain file where bob's working directory should go makes his spawn fail.
    std::fs::create_dir_all(fx.config.tenants_root()).expect("tenants root");
    std::fs::write(fx.config.tenant_dirs("bob").working_dir, b"not a directory").expect("blocker");

    let summary = fx.registry.start_all().await.expect("start_all");

    let mut started = summary.started.clone();
    started.sort();
    assert_eq!(started, vec!["alice".to_owned(), "carol".to_owned()]);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0, "bob");
    assert!(matches!(summary.failed[0].1, AppError::Spawn(_)));

    for id in ["alice", "carol"] {
        let facades = fx.registry.get(id).expect("running");
        let account: String = facades
            .engine
            .call_as("accountId", vec![])
            .await
            .expect("accountId");
        assert_eq!(account, id);
    }
    assert!(matches!(fx.registry.get("bob"), Err(AppError::NotRunning(_))));
    assert_eq!(fx.registry.account_ids(), vec!["alice", "carol"]);

    fx.registry.stop_all();
}

/// Accounts already running count as started.
#[tokio::test]
async fn start_all_tolerates_running_tenants() {
    let fx = fixture(&["alice", "bob"]).await;
    fx.registry.start("alice").await.expect("start alice");
    let alice_pid = fx.registry.process_id("alice");

    let summary = fx.registry.start_all().await.expect("start_all");

    assert!(summary.failed.is_empty(), "{:?}", summary.failed);
    assert_eq!(summary.started.len(), 2);
    assert_eq!(fx.registry.process_id("alice"), alice_pid);
    assert!(fx.registry.is_running("bob"));

    fx.registry.stop_all();
}

/// An empty store starts nothing.
#[tokio::test]
async fn start_all_with_no_accounts() {
    let fx = fixture(&[]).await;

    let summary = fx.registry.start_all().await.expect("start_all");

    assert!(summary.started.is_empty());
    assert!(summary.failed.is_empty());
}
