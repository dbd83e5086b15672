//! External-CI ingest: setup → events → teardown, with ordering, tenant,
//! and batch-boundary checks.

mod common;

use common::{create_api_key, create_project, signup, start_test_server, TestServer};

async fn setup_session(
    server: &TestServer,
    api_key: &str,
    project_id: &str,
) -> (String, String, String) {
    let resp = reqwest::Client::new()
        .post(format!("{}/api/ingest/setup", server.base))
        .header("x-api-key", api_key)
        .json(&serde_json::json!({
            "projectId": project_id,
            "framework": "playwright",
            "reporterVersion": "1.0.0",
            "totalTests": 2,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = resp.json().await.unwrap();
    (
        body["sessionId"].as_str().unwrap().to_string(),
        body["taskId"].as_str().unwrap().to_string(),
        body["cycleId"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn full_ingest_lifecycle() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();
    let (token, org_id, _) = signup(&server, "x", "a@x.io").await;
    let api_key = create_api_key(&server, &token).await;
    let project_id = create_project(&server, &token, "e2e").await;

    let (session_id, task_id, cycle_id) =
        setup_session(&server, &api_key, &project_id).await;
    assert!(task_id.starts_with("ingest-"));

    // The execution exists, RUNNING, with the sentinel image.
    let execution: serde_json::Value = client
        .get(format!("{}/api/executions/{task_id}", server.base))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(execution["status"], "RUNNING");
    assert_eq!(execution["source"], "external-ci");
    assert_eq!(execution["image"], "external-ci");
    assert_eq!(execution["orgId"], org_id.as_str());

    // Stream one batch: begin, end, raw log line.
    let resp = client
        .post(format!("{}/api/ingest/event", server.base))
        .header("x-api-key", &api_key)
        .json(&serde_json::json!({
            "sessionId": session_id,
            "events": [
                {"type": "test-begin", "testId": "t-a", "title": "A", "file": "a.spec.ts", "timestamp": 1},
                {"type": "log", "chunk": "console output", "timestamp": 2},
                {"type": "test-end", "testId": "t-a", "status": "passed", "duration": 120, "timestamp": 3},
            ],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["processed"], 3);

    // Give the fire-and-forget batch a beat to land in the cache.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let resp = client
        .post(format!("{}/api/ingest/teardown", server.base))
        .header("x-api-key", &api_key)
        .json(&serde_json::json!({
            "sessionId": session_id,
            "status": "PASSED",
            "summary": {"total": 2, "passed": 2, "failed": 0, "skipped": 0, "duration": 500},
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Execution finalized with the drained buffers, in arrival order.
    let execution: serde_json::Value = client
        .get(format!("{}/api/executions/{task_id}", server.base))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(execution["status"], "PASSED");
    assert_eq!(execution["tests"].as_array().unwrap().len(), 1);
    assert_eq!(execution["tests"][0]["testId"], "t-a");
    let output = execution["output"].as_str().unwrap();
    let begin_at = output.find("▶ RUNNING  A").unwrap();
    let log_at = output.find("console output").unwrap();
    let end_at = output.find("✔ PASSED  t-a").unwrap();
    assert!(begin_at < log_at && log_at < end_at, "output out of order: {output}");

    // Cycle completed with the reporter's summary.
    let cycle: serde_json::Value = client
        .get(format!("{}/api/test-cycles/{cycle_id}", server.base))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cycle["status"], "COMPLETED");
    assert_eq!(cycle["summary"]["passed"], 2);
    assert_eq!(cycle["items"][0]["status"], "PASSED");

    // Archive row exists; cache keys are gone.
    server
        .state
        .store
        .get_archived_ingest_session(&org_id, &session_id)
        .await
        .unwrap();
    assert!(server.state.cache.get_log(&task_id).await.is_none());
    assert!(server.state.cache.get_session(&session_id).await.is_none());

    // Duplicate teardown after the purge is a 404.
    let resp = client
        .post(format!("{}/api/ingest/teardown", server.base))
        .header("x-api-key", &api_key)
        .json(&serde_json::json!({
            "sessionId": session_id,
            "status": "PASSED",
            "summary": {"total": 2, "passed": 2, "failed": 0, "skipped": 0, "duration": 500},
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn event_batch_bounds_enforced() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();
    let (token, _org_id, _) = signup(&server, "x", "a@x.io").await;
    let api_key = create_api_key(&server, &token).await;
    let project_id = create_project(&server, &token, "e2e").await;
    let (session_id, _task_id, _) = setup_session(&server, &api_key, &project_id).await;

    // Empty batch.
    let resp = client
        .post(format!("{}/api/ingest/event", server.base))
        .header("x-api-key", &api_key)
        .json(&serde_json::json!({ "sessionId": session_id, "events": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // 101 events.
    let events: Vec<serde_json::Value> = (0..101)
        .map(|i| serde_json::json!({"type": "log", "chunk": format!("l{i}"), "timestamp": i}))
        .collect();
    let resp = client
        .post(format!("{}/api/ingest/event", server.base))
        .header("x-api-key", &api_key)
        .json(&serde_json::json!({ "sessionId": session_id, "events": events }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Oversized chunk.
    let resp = client
        .post(format!("{}/api/ingest/event", server.base))
        .header("x-api-key", &api_key)
        .json(&serde_json::json!({
            "sessionId": session_id,
            "events": [{"type": "log", "chunk": "x".repeat(8193), "timestamp": 1}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn sessions_are_tenant_scoped() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();
    let (token_a, _org_a, _) = signup(&server, "org-a", "a@a.io").await;
    let (token_b, _org_b, _) = signup(&server, "org-b", "b@b.io").await;
    let key_a = create_api_key(&server, &token_a).await;
    let key_b = create_api_key(&server, &token_b).await;
    let project_a = create_project(&server, &token_a, "e2e").await;

    let (session_id, _task_id, _) = setup_session(&server, &key_a, &project_a).await;

    // Org B's key cannot feed org A's session.
    let resp = client
        .post(format!("{}/api/ingest/event", server.base))
        .header("x-api-key", &key_b)
        .json(&serde_json::json!({
            "sessionId": session_id,
            "events": [{"type": "log", "chunk": "intruder", "timestamp": 1}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    // Nor set up a session against org A's project.
    let resp = client
        .post(format!("{}/api/ingest/setup", server.base))
        .header("x-api-key", &key_b)
        .json(&serde_json::json!({
            "projectId": project_a,
            "framework": "playwright",
            "reporterVersion": "1.0.0",
            "totalTests": 1,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    // Unknown session is a 404.
    let resp = client
        .post(format!("{}/api/ingest/event", server.base))
        .header("x-api-key", &key_a)
        .json(&serde_json::json!({
            "sessionId": "11111111-2222-3333-4444-555555555555",
            "events": [{"type": "log", "chunk": "x", "timestamp": 1}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn ingest_requires_api_key_not_jwt() {
    let server = start_test_server().await;
    let (token, _org_id, _) = signup(&server, "x", "a@x.io").await;
    let project_id = create_project(&server, &token, "e2e").await;

    let resp = reqwest::Client::new()
        .post(format!("{}/api/ingest/setup", server.base))
        .bearer_auth(&token)
        .json(&serde_json::json!({
            "projectId": project_id,
            "framework": "playwright",
            "reporterVersion": "1.0.0",
            "totalTests": 1,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn failed_teardown_marks_cycle_item_failed() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();
    let (token, _org_id, _) = signup(&server, "x", "a@x.io").await;
    let api_key = create_api_key(&server, &token).await;
    let project_id = create_project(&server, &token, "e2e").await;
    let (session_id, task_id, cycle_id) =
        setup_session(&server, &api_key, &project_id).await;

    client
        .post(format!("{}/api/ingest/event", server.base))
        .header("x-api-key", &api_key)
        .json(&serde_json::json!({
            "sessionId": session_id,
            "events": [
                {"type": "test-end", "testId": "t-a", "status": "failed", "duration": 10,
                 "error": "expected true to be false", "timestamp": 1},
            ],
        }))
        .send()
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let resp = client
        .post(format!("{}/api/ingest/teardown", server.base))
        .header("x-api-key", &api_key)
        .json(&serde_json::json!({
            "sessionId": session_id,
            "status": "FAILED",
            "summary": {"total": 2, "passed": 1, "failed": 1, "skipped": 0, "duration": 300},
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let execution: serde_json::Value = client
        .get(format!("{}/api/executions/{task_id}", server.base))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(execution["status"], "FAILED");
    assert_eq!(execution["tests"][0]["error"], "expected true to be false");

    let cycle: serde_json::Value = client
        .get(format!("{}/api/test-cycles/{cycle_id}", server.base))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cycle["items"][0]["status"], "FAILED");
    assert_eq!(cycle["summary"]["failed"], 1);
}
