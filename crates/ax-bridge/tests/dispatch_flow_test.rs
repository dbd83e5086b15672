//! Scenario: dispatch → worker callback → list, plus plan-limit and
//! env-var handling on the dispatch path.

mod common;

use common::{
    create_project, execution_request_body, signup, start_test_server, WORKER_SECRET,
};

#[tokio::test]
async fn dispatch_then_worker_update_then_list() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();
    let (token, org_id, _) = signup(&server, "x", "a@x.io").await;

    let resp = client
        .post(format!("{}/api/execution-request", server.base))
        .bearer_auth(&token)
        .json(&execution_request_body("t1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "Message queued successfully");
    assert_eq!(body["taskId"], "t1");

    // One persistent message with the org stamped in.
    let published = server.queue.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0.organization_id, org_id);

    // Worker reports completion using the shared secret.
    let resp = client
        .post(format!("{}/executions/update", server.base))
        .header("authorization", WORKER_SECRET)
        .json(&serde_json::json!({
            "taskId": "t1",
            "orgId": org_id,
            "status": "PASSED",
            "endTime": chrono::Utc::now().to_rfc3339(),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let list: serde_json::Value = client
        .get(format!("{}/api/executions", server.base))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let executions = list.as_array().unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0]["taskId"], "t1");
    assert_eq!(executions[0]["status"], "PASSED");

    // Completed run fed the per-image perf rollup.
    let resp = client
        .get(format!("{}/api/metrics/agnox%2Frunner:1", server.base))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn worker_endpoints_reject_bad_secret() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();
    let (_token, org_id, _) = signup(&server, "x", "a@x.io").await;

    for (path, payload) in [
        (
            "/executions/update",
            serde_json::json!({"taskId": "t1", "orgId": org_id, "status": "PASSED"}),
        ),
        (
            "/executions/log",
            serde_json::json!({"taskId": "t1", "orgId": org_id, "log": "line"}),
        ),
    ] {
        let resp = client
            .post(format!("{}{path}", server.base))
            .header("authorization", "wrong-secret")
            .json(&payload)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401, "{path} must reject a bad secret");
    }
}

#[tokio::test]
async fn worker_callback_without_org_is_dropped() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();
    let (token, _org_id, _) = signup(&server, "x", "a@x.io").await;

    client
        .post(format!("{}/api/execution-request", server.base))
        .bearer_auth(&token)
        .json(&execution_request_body("t1"))
        .send()
        .await
        .unwrap();

    let resp = client
        .post(format!("{}/executions/update", server.base))
        .header("authorization", WORKER_SECRET)
        .json(&serde_json::json!({ "taskId": "t1", "status": "PASSED" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Row unchanged.
    let list: serde_json::Value = client
        .get(format!("{}/api/executions", server.base))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list[0]["status"], "PENDING");
}

#[tokio::test]
async fn run_limit_returns_403_with_numbers() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();
    let (token, org_id, _) = signup(&server, "x", "a@x.io").await;

    // Tighten the org's monthly run ceiling to 2 (billing seam).
    let mut limits = ax_core::types::OrgLimits::for_plan(ax_core::types::Plan::Free);
    limits.max_test_runs = 2;
    server
        .state
        .store
        .update_org_plan(&org_id, ax_core::types::Plan::Free, limits)
        .await
        .unwrap();

    for task in ["t1", "t2"] {
        let resp = client
            .post(format!("{}/api/execution-request", server.base))
            .bearer_auth(&token)
            .json(&execution_request_body(task))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    let resp = client
        .post(format!("{}/api/execution-request", server.base))
        .bearer_auth(&token)
        .json(&execution_request_body("t3"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["limit"], 2);
    assert_eq!(body["current"], 2);
}

#[tokio::test]
async fn project_limit_enforced() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();
    let (token, _org_id, _) = signup(&server, "x", "a@x.io").await;

    // Free plan allows three projects.
    for slug in ["p1", "p2", "p3"] {
        create_project(&server, &token, slug).await;
    }
    let resp = client
        .post(format!("{}/api/projects", server.base))
        .bearer_auth(&token)
        .json(&serde_json::json!({ "name": "P4", "slug": "p4" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["limit"], 3);
}

#[tokio::test]
async fn invalid_dispatch_payloads_rejected() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();
    let (token, _org_id, _) = signup(&server, "x", "a@x.io").await;

    // Empty image.
    let mut body = execution_request_body("t1");
    body["image"] = serde_json::json!("");
    let resp = client
        .post(format!("{}/api/execution-request", server.base))
        .bearer_auth(&token)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Retry attempts out of range.
    let mut body = execution_request_body("t1");
    body["config"]["retryAttempts"] = serde_json::json!(6);
    let resp = client
        .post(format!("{}/api/execution-request", server.base))
        .bearer_auth(&token)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Env var key starting with a digit.
    let mut body = execution_request_body("t1");
    body["config"]["envVars"] = serde_json::json!({ "1BAD": "x" });
    let resp = client
        .post(format!("{}/api/execution-request", server.base))
        .bearer_auth(&token)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Nothing reached the queue.
    assert!(server.queue.published().is_empty());
}

#[tokio::test]
async fn secret_env_vars_masked_on_read_plain_in_task() {
    let server = start_test_server().await;
    let client = reqwest::Client::new();
    let (token, _org_id, _) = signup(&server, "x", "a@x.io").await;
    let project_id = create_project(&server, &token, "checkout").await;

    let resp = client
        .post(format!("{}/api/projects/{project_id}/env", server.base))
        .bearer_auth(&token)
        .json(&serde_json::json!({
            "key": "DB_PASSWORD",
            "value": "hunter2",
            "isSecret": true,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let created: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(created["value"], "********");

    // Every read path masks.
    let listed: serde_json::Value = client
        .get(format!("{}/api/projects/{project_id}/env", server.base))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed[0]["value"], "********");

    // Dispatch resolves the plaintext into the worker task.
    let mut body = execution_request_body("t1");
    body["projectId"] = serde_json::json!(project_id);
    let resp = client
        .post(format!("{}/api/execution-request", server.base))
        .bearer_auth(&token)
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let published = server.queue.published();
    assert_eq!(published[0].0.config.env_vars["DB_PASSWORD"], "hunter2");
}
