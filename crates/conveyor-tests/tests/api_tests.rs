//! API tests against a served router over in-memory stores.
//!
//! Run with: `cargo test -p conveyor-tests --test api_tests`

use conveyor_core::build::BuildStatus;
use conveyor_tests::{
    ApiTestClient, RELEASE_PIPELINE, SIMPLE_PIPELINE, SLOW_PIPELINE, TestSystem, pipeline_config,
    start_test_server,
};
use reqwest::StatusCode;
use serde_json::{Value, json};
use std::time::Duration;

async fn serve(system: &TestSystem) -> ApiTestClient {
    let (addr, _handle) = start_test_server(system.state.clone())
        .await
        .expect("Failed to start server");
    ApiTestClient::new(addr)
}

async fn save(client: &ApiTestClient, name: &str, yaml: &str) -> Value {
    let body = json!({ "config": pipeline_config(yaml) });
    let resp = client
        .put(&ApiTestClient::pipeline_path(name, "/config"), &body)
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::OK);
    resp.json().await.expect("Failed to parse JSON")
}

#[tokio::test]
async fn test_health_and_ready() {
    let system = TestSystem::new().await;
    let client = serve(&system).await;

    assert!(client.health().await.expect("Health check failed"));
    let resp = client.get("/ready").await.expect("Request failed");
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_save_and_get_pipeline() {
    let system = TestSystem::new().await;
    let client = serve(&system).await;

    let saved = save(&client, "app", SIMPLE_PIPELINE).await;
    assert_eq!(saved["config_version"], 1);
    assert_eq!(saved["paused"], false);

    let resp = client
        .get(&ApiTestClient::pipeline_path("app", ""))
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::OK);
    let pipeline: Value = resp.json().await.unwrap();
    assert_eq!(pipeline["name"], "app");
    assert_eq!(pipeline["team"], "main");

    let resp = client
        .get("/api/v1/teams/main/pipelines")
        .await
        .expect("Request failed");
    let list: Value = resp.json().await.unwrap();
    assert_eq!(list.as_array().map(|a| a.len()), Some(1));

    let resp = client
        .get("/api/v1/teams/other/pipelines")
        .await
        .expect("Request failed");
    let list: Value = resp.json().await.unwrap();
    assert_eq!(list.as_array().map(|a| a.len()), Some(0));
}

#[tokio::test]
async fn test_stale_config_save_conflicts() {
    let system = TestSystem::new().await;
    let client = serve(&system).await;
    save(&client, "app", SIMPLE_PIPELINE).await;

    let body = json!({
        "config": pipeline_config(SIMPLE_PIPELINE),
        "expected_version": 0,
    });
    let resp = client
        .put(&ApiTestClient::pipeline_path("app", "/config"), &body)
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let err: Value = resp.json().await.unwrap();
    assert!(err["error"].is_string());
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let system = TestSystem::new().await;
    let client = serve(&system).await;

    let body = json!({
        "config": {
            "jobs": [{ "name": "unit", "plan": [{ "get": { "name": "missing" } }] }]
        }
    });
    let resp = client
        .put(&ApiTestClient::pipeline_path("app", "/config"), &body)
        .await
        .expect("Request failed");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_things_are_not_found() {
    let system = TestSystem::new().await;
    let client = serve(&system).await;
    save(&client, "app", SIMPLE_PIPELINE).await;

    let resp = client
        .get(&ApiTestClient::pipeline_path("nope", ""))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = client
        .get(&ApiTestClient::pipeline_path("app", "/jobs/nope"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = client
        .get("/api/v1/builds/0190d0a4-5e1c-7b3a-9f2e-4c8d1a6b3e7f")
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = client.get("/api/v1/builds/not-an-id").await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // Never checked, so there is no version history to show.
    let resp = client
        .get(&ApiTestClient::pipeline_path("app", "/resources/repo/versions"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_trigger_responses() {
    let system = TestSystem::new().await;
    let client = serve(&system).await;
    save(&client, "app", RELEASE_PIPELINE).await;

    let resp = client
        .post_empty(&ApiTestClient::pipeline_path("app", "/jobs/nightly/builds"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    // repo has not been checked yet, so the request waits.
    let resp = client
        .post_empty(&ApiTestClient::pipeline_path("app", "/jobs/publish/builds"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let queued: Value = resp.json().await.unwrap();
    assert_eq!(queued["outcome"], "queued");
    assert_eq!(queued["pending"], 1);

    let resp = client
        .get(&ApiTestClient::pipeline_path("app", "/jobs/publish"))
        .await
        .unwrap();
    let job: Value = resp.json().await.unwrap();
    assert_eq!(job["pending_triggers"], 1);
    assert_eq!(job["inputs"], json!(["repo"]));
}

#[tokio::test]
async fn test_check_and_manage_versions() {
    let system = TestSystem::new().await;
    let client = serve(&system).await;
    save(&client, "app", SIMPLE_PIPELINE).await;
    system.capability.respond("git", &["a", "b"]);

    let resp = client
        .post_empty(&ApiTestClient::pipeline_path("app", "/resources/repo/check"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let handle: Value = resp.json().await.unwrap();
    let check_path = format!("/api/v1/checks/{}", handle["id"].as_str().unwrap());

    let status = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let handle: Value = client.get(&check_path).await.unwrap().json().await.unwrap();
            if handle["status"] == "succeeded" || handle["status"] == "errored" {
                return handle["status"].clone();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("check did not finish");
    assert_eq!(status, "succeeded");

    let versions_path = ApiTestClient::pipeline_path("app", "/resources/repo/versions");
    let versions: Value = client.get(&versions_path).await.unwrap().json().await.unwrap();
    let versions = versions.as_array().unwrap().clone();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0]["version"], json!({ "ref": "b" }));
    let b = versions[0]["id"].as_str().unwrap().to_string();

    let resp = client
        .put_empty(&format!("{versions_path}/{b}/disable"))
        .await
        .unwrap();
    assert!(resp.status().is_success());
    let resp = client
        .put(&format!("{versions_path}/{b}/pin"), &json!({ "comment": "hold" }))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resource: Value = client
        .get(&ApiTestClient::pipeline_path("app", "/resources/repo"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resource["pin_comment"], "hold");
    assert_eq!(resource["type"], "git");

    let resp = client
        .delete(&ApiTestClient::pipeline_path("app", "/resources/repo/pin"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let cleared: Value = client.delete(&versions_path).await.unwrap().json().await.unwrap();
    assert_eq!(cleared["deleted"], 2);
}

#[tokio::test]
async fn test_one_off_build_streams_events() {
    let system = TestSystem::new().await;
    let client = serve(&system).await;

    let body = json!({
        "plan": [{ "task": { "name": "hello", "config": { "run": { "path": "true" } } } }]
    });
    let resp = client.post("/api/v1/teams/main/builds", &body).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let build: Value = resp.json().await.unwrap();
    assert!(build["pipeline_id"].is_null());
    let id = build["id"].as_str().unwrap().to_string();

    // The stream closes once the build's log is finished.
    let events_path = format!("/api/v1/builds/{id}/events");
    let body = client.get(&events_path).await.unwrap().text().await.unwrap();
    assert!(body.contains("running true"));
    assert!(body.contains("\"type\":\"finish\""));
    assert!(
        body.lines()
            .any(|l| l.strip_prefix("event:").map(str::trim) == Some("end"))
    );

    let build: Value = client
        .get(&format!("/api/v1/builds/{id}"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(build["status"], "succeeded");

    let resumed = events_after(&client, &events_path, 0).await;
    assert!(!resumed.contains("\"id\":0,\"at\""));
    assert!(resumed.contains("\"id\":1,\"at\""));
}

async fn events_after(client: &ApiTestClient, path: &str, last: u64) -> String {
    conveyor_tests::test_client()
        .get(client.url(path))
        .header("Last-Event-ID", last.to_string())
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_abort_build() {
    let system = TestSystem::new().await;
    let client = serve(&system).await;
    save(&client, "app", SLOW_PIPELINE).await;

    let resp = client
        .post_empty(&ApiTestClient::pipeline_path("app", "/jobs/soak/builds"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created: Value = resp.json().await.unwrap();
    assert_eq!(created["outcome"], "created");
    let id = created["id"].as_str().unwrap().to_string();

    tokio::time::timeout(Duration::from_secs(5), async {
        while system.runtime.tasks().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let resp = client
        .put_empty(&format!("/api/v1/builds/{id}/abort"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let build = system.wait_for_build(id.parse().unwrap()).await.unwrap();
    assert_eq!(build.status, BuildStatus::Aborted);
}

#[tokio::test]
async fn test_worker_lifecycle() {
    let system = TestSystem::new().await;
    let client = serve(&system).await;

    let resp = client
        .post(
            "/api/v1/workers",
            &json!({ "name": "w2", "platform": "linux", "resource_types": ["git"] }),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let worker: Value = resp.json().await.unwrap();
    assert_eq!(worker["state"], "running");

    // Only landed or stalled workers can be pruned.
    let resp = client.delete("/api/v1/workers/w2").await.unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let worker: Value = client
        .put_empty("/api/v1/workers/w2/land")
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(worker["state"], "landed");

    let resp = client.delete("/api/v1/workers/w2").await.unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    let resp = client.get("/api/v1/workers/w2").await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let retired: Value = client
        .put_empty("/api/v1/workers/worker-1/retire")
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(retired["removed"], true);

    let workers: Value = client.get("/api/v1/workers").await.unwrap().json().await.unwrap();
    assert_eq!(workers.as_array().map(|a| a.len()), Some(0));
}
