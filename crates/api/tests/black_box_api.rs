use std::sync::Arc;

use claimflow_api::app::services::AppServices;
use claimflow_infra::PipelineConfig;
use claimflow_infra::evaluator::LoggingEvaluator;
use reqwest::StatusCode;
use serde_json::json;

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        // Same router as prod over in-memory services, bound to an ephemeral port.
        let services = AppServices::in_memory(&PipelineConfig::default(), Arc::new(LoggingEvaluator));
        let app = claimflow_api::app::build_app_with(services);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn submit(client: &reqwest::Client, base_url: &str, body: serde_json::Value) -> reqwest::Response {
    client
        .post(format!("{}/lab-tests", base_url))
        .header("x-user-id", "U")
        .header("x-lab-code", "LAB-1")
        .json(&body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn health_is_public() {
    let srv = TestServer::spawn().await;

    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn user_identity_required_for_lab_tests() {
    let srv = TestServer::spawn().await;

    let client = reqwest::Client::new();
    let res = client
        .post(format!("{}/lab-tests", srv.base_url))
        .json(&json!({ "ians": ["A1"] }))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn whoami_reflects_gateway_headers() {
    let srv = TestServer::spawn().await;

    let client = reqwest::Client::new();
    let res = client
        .get(format!("{}/whoami", srv.base_url))
        .header("x-user-id", "U")
        .header("x-username", "jdoe")
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["user_id"], "U");
    assert_eq!(body["username"], "jdoe");
    assert!(body["lab_code"].is_null());
}

#[tokio::test]
async fn empty_batch_is_rejected() {
    let srv = TestServer::spawn().await;

    let client = reqwest::Client::new();
    let res = submit(&client, &srv.base_url, json!({ "ians": [], "test_method_code": "TM1" })).await;

    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn malformed_body_gets_a_json_error() {
    let srv = TestServer::spawn().await;

    let client = reqwest::Client::new();
    let res = submit(&client, &srv.base_url, json!({ "ians": [1, 2] })).await;

    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_body");
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn submitted_items_are_queued() {
    let srv = TestServer::spawn().await;

    let client = reqwest::Client::new();
    let res = submit(
        &client,
        &srv.base_url,
        json!({ "ians": ["A1", "A2"], "test_method_code": "TM1", "sample_type_code": "BLOOD" }),
    )
    .await;

    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: serde_json::Value = res.json().await.unwrap();
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["ian"], "A1");
    assert_eq!(items[1]["ian"], "A2");
    assert!(items[0]["message_id"].is_string());

    for ian in ["A1", "A2"] {
        let res = client
            .get(format!("{}/lab-tests/{}/status", srv.base_url, ian))
            .header("x-user-id", "U")
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let status: serde_json::Value = res.json().await.unwrap();
        assert_eq!(status["status"], "queued");
    }
}

#[tokio::test]
async fn status_of_unknown_work_item_is_not_found() {
    let srv = TestServer::spawn().await;

    let client = reqwest::Client::new();
    let res = client
        .get(format!("{}/lab-tests/NOPE/status", srv.base_url))
        .header("x-user-id", "U")
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");
}
