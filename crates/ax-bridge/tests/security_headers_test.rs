mod common;

use common::{start_test_server, start_test_server_with, test_config};

#[tokio::test]
async fn security_headers_present_on_public_routes() {
    let server = start_test_server().await;

    let resp = reqwest::get(format!("{}/health", server.base)).await.unwrap();
    assert_eq!(resp.status(), 200);

    let headers = resp.headers();
    assert_eq!(headers.get("X-Content-Type-Options").unwrap(), "nosniff");
    assert_eq!(headers.get("X-Frame-Options").unwrap(), "DENY");
    assert_eq!(headers.get("X-XSS-Protection").unwrap(), "1; mode=block");
    assert_eq!(
        headers.get("Referrer-Policy").unwrap(),
        "strict-origin-when-cross-origin"
    );
}

#[tokio::test]
async fn hsts_absent_outside_production() {
    let server = start_test_server().await;
    let resp = reqwest::get(format!("{}/health", server.base)).await.unwrap();
    assert!(resp.headers().get("Strict-Transport-Security").is_none());
}

#[tokio::test]
async fn hsts_present_in_production() {
    let mut config = test_config();
    config.server.production = true;
    let server = start_test_server_with(config).await;

    let resp = reqwest::get(format!("{}/health", server.base)).await.unwrap();
    assert_eq!(
        resp.headers().get("Strict-Transport-Security").unwrap(),
        "max-age=63072000; includeSubDomains"
    );
}

#[tokio::test]
async fn headers_present_even_on_auth_errors() {
    let server = start_test_server().await;
    let resp = reqwest::get(format!("{}/api/executions", server.base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    assert_eq!(
        resp.headers().get("X-Content-Type-Options").unwrap(),
        "nosniff"
    );
}
