//! Shared helpers for the ax-bridge integration suites.
#![allow(dead_code)]

use std::sync::Arc;

use ax_bridge::http_api::{api_router, ApiState};
use ax_cache::LiveCache;
use ax_core::config::Config;
use ax_queue::{MemoryQueue, TaskPublisher};
use ax_store::StoreDb;

pub const WORKER_SECRET: &str = "worker-shared-secret-for-tests";

pub struct TestServer {
    pub base: String,
    pub state: Arc<ApiState>,
    pub queue: Arc<MemoryQueue>,
}

/// Test configuration: fixed secrets, dev mode, memory-backed everything.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.auth.jwt_secret = "jwt-secret-for-tests".into();
    config.auth.worker_secret = WORKER_SECRET.into();
    config.security.report_token_secret = "report-secret-for-tests".into();
    config.security.env_encryption_key = {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode([7u8; 32])
    };
    config
}

/// Spin up an API server on a random port, return its handle.
pub async fn start_test_server() -> TestServer {
    start_test_server_with(test_config()).await
}

pub async fn start_test_server_with(config: Config) -> TestServer {
    let store = Arc::new(StoreDb::open_in_memory().await.expect("in-memory store"));
    let cache = Arc::new(LiveCache::memory());
    let queue = Arc::new(MemoryQueue::new());
    let publisher: Arc<dyn TaskPublisher> = queue.clone();

    let state = Arc::new(ApiState::new(config, store, cache, publisher));
    let router = api_router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind to ephemeral port");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestServer {
        base: format!("http://{addr}"),
        state,
        queue,
    }
}

/// Sign up a fresh org; returns `(token, org_id, user_id)`.
pub async fn signup(server: &TestServer, slug: &str, email: &str) -> (String, String, String) {
    let resp = reqwest::Client::new()
        .post(format!("{}/api/auth/signup", server.base))
        .json(&serde_json::json!({
            "orgName": format!("Org {slug}"),
            "orgSlug": slug,
            "email": email,
            "name": "Test Admin",
            "password": "correct-horse-battery",
        }))
        .send()
        .await
        .expect("signup request");
    assert_eq!(resp.status(), 201, "signup failed");
    let body: serde_json::Value = resp.json().await.unwrap();
    (
        body["token"].as_str().unwrap().to_string(),
        body["organization"]["id"].as_str().unwrap().to_string(),
        body["user"]["id"].as_str().unwrap().to_string(),
    )
}

/// Mint an API key for the caller's org (admin token required).
pub async fn create_api_key(server: &TestServer, token: &str) -> String {
    let resp = reqwest::Client::new()
        .post(format!("{}/api/api-keys", server.base))
        .bearer_auth(token)
        .json(&serde_json::json!({ "label": "ci" }))
        .send()
        .await
        .expect("api key request");
    assert_eq!(resp.status(), 201, "api key creation failed");
    let body: serde_json::Value = resp.json().await.unwrap();
    body["key"].as_str().unwrap().to_string()
}

/// Create a project; returns its id.
pub async fn create_project(server: &TestServer, token: &str, slug: &str) -> String {
    let resp = reqwest::Client::new()
        .post(format!("{}/api/projects", server.base))
        .bearer_auth(token)
        .json(&serde_json::json!({ "name": format!("Project {slug}"), "slug": slug }))
        .send()
        .await
        .expect("project request");
    assert_eq!(resp.status(), 201, "project creation failed");
    let body: serde_json::Value = resp.json().await.unwrap();
    body["id"].as_str().unwrap().to_string()
}

/// Minimal execution-request payload.
pub fn execution_request_body(task_id: &str) -> serde_json::Value {
    serde_json::json!({
        "taskId": task_id,
        "image": "agnox/runner:1",
        "command": "run",
        "config": { "environment": "staging" },
    })
}
