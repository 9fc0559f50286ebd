//! Job notification delivery tests.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use common::TestHarness;
use serde_json::{json, Value};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn notifications(server: &MockServer, status: &str) -> Vec<Value> {
    // Delivery runs on its own task
    for _ in 0..50 {
        let received: Vec<Value> = server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter_map(|request| serde_json::from_slice(&request.body).ok())
            .filter(|body: &Value| body["status"] == status)
            .collect();
        if !received.is_empty() {
            return received;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Vec::new()
}

#[tokio::test]
async fn failed_job_is_pushed_to_notify_url() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let mut config = common::test_config();
    config.notify_url = Some(format!("{}/jobs/events", server.uri()));
    let harness = TestHarness::with_config(config);
    harness.fund(500).await;
    harness
        .start_job("gen_notify", 200, 1)
        .await
        .assert_status(StatusCode::CREATED);

    harness
        .report("gen_notify", json!({ "terminal_error": "out of memory" }))
        .await
        .assert_status_ok();

    let failed = notifications(&server, "failed").await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["process_id"], "gen_notify");
    assert_eq!(failed[0]["error"], "out of memory");
    assert!(failed[0].get("payload").is_none());
}

#[tokio::test]
async fn completed_job_carries_outputs() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut config = common::test_config();
    config.notify_url = Some(server.uri());
    let harness = TestHarness::with_config(config);
    harness.fund(500).await;
    harness
        .start_job("gen_done", 100, 1)
        .await
        .assert_status(StatusCode::CREATED);

    harness
        .report("gen_done", json!({ "completed_outputs": [{"url": "out.png"}] }))
        .await
        .assert_status_ok();

    let completed = notifications(&server, "completed").await;
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0]["payload"][0]["url"], "out.png");
}

#[tokio::test]
async fn unreachable_notifier_does_not_fail_the_report() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut config = common::test_config();
    config.notify_url = Some(server.uri());
    let harness = TestHarness::with_config(config);
    harness.fund(500).await;
    harness
        .start_job("gen_noisy", 100, 1)
        .await
        .assert_status(StatusCode::CREATED);

    let response = harness
        .report("gen_noisy", json!({ "failed_count": 1 }))
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["transition"], "failed");
    assert_eq!(harness.balance().await, 500);
}
