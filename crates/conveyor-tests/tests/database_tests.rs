//! PostgreSQL store tests.
//!
//! Run with: `cargo test -p conveyor-tests --test database_tests --features integration`

#![cfg(feature = "integration")]

use conveyor_core::build::BuildStatus;
use conveyor_core::events::{EventPayload, LogPayload, LogStream};
use conveyor_core::lock::LockId;
use conveyor_core::pipeline::CheckableKind;
use conveyor_core::version::ScopeSpec;
use conveyor_tests::fakes::version;
use conveyor_tests::{SIMPLE_PIPELINE, TestContext, TestSystem, pipeline_config};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::BTreeMap;

fn scope_spec(uri: &str) -> ScopeSpec {
    ScopeSpec::new(
        "git",
        BTreeMap::from([("uri".to_string(), json!(uri))]),
        None,
    )
}

#[tokio::test]
async fn test_pipeline_save_is_versioned() {
    let ctx = TestContext::postgres_only().await.expect("Failed to create test context");
    let stores = ctx.stores();
    let config = pipeline_config(SIMPLE_PIPELINE);

    let first = stores.pipelines.save("main", "app", &config, None).await.unwrap();
    assert_eq!(first.config_version, 1);
    let second = stores.pipelines.save("main", "app", &config, Some(1)).await.unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.config_version, 2);

    let err = stores
        .pipelines
        .save("main", "app", &config, Some(1))
        .await
        .unwrap_err();
    assert!(matches!(err, conveyor_core::Error::ConfigConflict { .. }));

    let job = stores.pipelines.job_state(first.id, "unit").await.unwrap().unwrap();
    assert!(!job.paused);
    assert!(
        stores
            .pipelines
            .resource_state(first.id, CheckableKind::Resource, "repo")
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_versions_are_deduplicated_in_check_order() {
    let ctx = TestContext::postgres_only().await.expect("Failed to create test context");
    let stores = ctx.stores();
    let scope = stores
        .versions
        .find_or_create_scope(&scope_spec("https://example.com/app.git"))
        .await
        .unwrap();

    let inserted = stores
        .versions
        .save_versions(&scope.id, &[version("a"), version("b")])
        .await
        .unwrap();
    assert_eq!(inserted, 2);
    let inserted = stores
        .versions
        .save_versions(&scope.id, &[version("b"), version("c")])
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let refs: Vec<_> = stores
        .versions
        .versions(&scope.id, None)
        .await
        .unwrap()
        .into_iter()
        .map(|v| v.version["ref"].clone())
        .collect();
    assert_eq!(refs, vec!["c", "b", "a"]);

    let latest = stores.versions.latest_version(&scope.id).await.unwrap().unwrap();
    stores.versions.set_version_enabled(latest.id, false).await.unwrap();
    let enabled = stores.versions.latest_enabled(&scope.id).await.unwrap().unwrap();
    assert_eq!(enabled.version, version("b"));

    assert_eq!(stores.versions.clear_versions(&scope.id).await.unwrap(), 3);
}

#[tokio::test]
async fn test_event_log_and_locks() {
    let ctx = TestContext::postgres_only().await.expect("Failed to create test context");
    let stores = ctx.stores();
    let system = TestSystem::with_stores(stores.clone()).await.unwrap();
    let pipeline = system.save_pipeline("app", SIMPLE_PIPELINE).await.unwrap();
    system.capability.respond("git", &["a"]);
    system.check(pipeline.id, "repo").await.unwrap();
    system.tick(pipeline.id).await.unwrap();

    let build = system.builds(pipeline.id, "unit").await.unwrap().remove(0);
    let build = system.wait_for_build(build.id).await.unwrap();
    assert_eq!(build.status, BuildStatus::Succeeded);
    assert!(stores.events.is_completed(build.id).await.unwrap());

    let events = stores.events.read(build.id, 0, 1000).await.unwrap();
    assert!(events.windows(2).all(|w| w[1].id == w[0].id + 1));
    assert!(events.iter().any(|e| matches!(
        &e.payload,
        EventPayload::Log(LogPayload { stream: LogStream::Stdout, .. })
    )));

    let lock = stores
        .locks
        .try_acquire(&LockId::build(build.id))
        .await
        .unwrap()
        .expect("lock is free");
    assert!(
        stores
            .locks
            .try_acquire(&LockId::build(build.id))
            .await
            .unwrap()
            .is_none()
    );
    lock.release().await.unwrap();
}
