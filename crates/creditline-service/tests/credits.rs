//! Balance, subscription and transaction history integration tests.

mod common;

use axum::http::StatusCode;
use common::{bearer_for, subscription_event, TestHarness};
use creditline_core::UserId;
use serde_json::Value;

// ============================================================================
// Balance
// ============================================================================

#[tokio::test]
async fn new_user_has_zero_balance() {
    let harness = TestHarness::new();

    let response = harness
        .server
        .get("/v1/credits/balance")
        .add_header("authorization", harness.user_auth_header())
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["credits"], 0);
    assert_eq!(body["plan"], "free");
    assert_eq!(body["has_active_subscription"], false);
    assert_eq!(body["sync"], "skipped");
}

#[tokio::test]
async fn balance_reflects_grants() {
    let harness = TestHarness::new();
    harness.fund(750).await;
    assert_eq!(harness.balance().await, 750);
}

#[tokio::test]
async fn get_balance_without_auth_fails() {
    let harness = TestHarness::new();

    harness
        .server
        .get("/v1/credits/balance")
        .await
        .assert_status_unauthorized();

    harness
        .server
        .get("/v1/credits/balance")
        .add_header("authorization", "Bearer not-a-jwt")
        .await
        .assert_status_unauthorized();
}

#[tokio::test]
async fn token_signed_with_another_secret_is_rejected() {
    let mut config = common::test_config();
    config.jwt_secret = Some("rotated-secret".into());
    let harness = TestHarness::with_config(config);

    // bearer_for signs with the default test secret
    harness
        .server
        .get("/v1/credits/balance")
        .add_header("authorization", bearer_for(&UserId::generate(), None))
        .await
        .assert_status_unauthorized();
}

#[tokio::test]
async fn service_can_read_user_balance() {
    let harness = TestHarness::new();
    harness.fund(300).await;

    let response = harness
        .server
        .get(&format!("/v1/users/{}/balance", harness.test_user_id))
        .add_header("x-api-key", &harness.service_api_key)
        .await;

    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["credits"], 300);

    harness
        .server
        .get(&format!("/v1/users/{}/balance", harness.test_user_id))
        .add_header("x-api-key", "wrong")
        .await
        .assert_status_unauthorized();
}

// ============================================================================
// Subscription
// ============================================================================

#[tokio::test]
async fn subscription_defaults_to_free() {
    let harness = TestHarness::new();

    let response = harness
        .server
        .get("/v1/subscription")
        .add_header("authorization", harness.user_auth_header())
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["plan"], "free");
    assert!(body["subscription"].is_null());
}

#[tokio::test]
async fn subscription_reflects_webhook_snapshot() {
    let harness = TestHarness::new();
    harness
        .signed_webhook(&subscription_event(
            "subscription.created",
            "sub_01",
            &harness.test_user_id,
            "ctm_01",
            "active",
            "pri_business_annual",
        ))
        .await
        .assert_status_ok();

    let response = harness
        .server
        .get("/v1/subscription")
        .add_header("authorization", harness.user_auth_header())
        .await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["plan"], "business");
    assert_eq!(body["has_active_subscription"], true);
    assert_eq!(body["subscription"]["subscription_id"], "sub_01");
    assert_eq!(body["subscription"]["billing_cycle"], "annual");
    assert!(!body["subscription"]["next_credit_date"].is_null());
}

// ============================================================================
// Transactions
// ============================================================================

async fn seeded_history(harness: &TestHarness) {
    harness.fund(1000).await;
    harness
        .start_job("gen_history_1", 300, 1)
        .await
        .assert_status(StatusCode::CREATED);
    harness.fund(200).await;
}

async fn list(harness: &TestHarness, query: &str) -> Value {
    let response = harness
        .server
        .get(&format!("/v1/credits/transactions{query}"))
        .add_header("authorization", harness.user_auth_header())
        .await;
    response.assert_status_ok();
    response.json()
}

#[tokio::test]
async fn transactions_newest_first_with_summary() {
    let harness = TestHarness::new();
    seeded_history(&harness).await;

    let body = list(&harness, "").await;
    let transactions = body["transactions"].as_array().unwrap();
    assert_eq!(transactions.len(), 3);
    assert_eq!(body["total"], 3);
    assert_eq!(body["has_more"], false);

    assert_eq!(transactions[0]["amount"], 200);
    assert_eq!(transactions[1]["type"], "usage_deduction");
    assert_eq!(transactions[1]["amount"], -300);
    assert_eq!(transactions[0]["balance_after"], 900);

    assert_eq!(body["summary"]["total_credited"], 1200);
    assert_eq!(body["summary"]["total_debited"], 300);
    assert_eq!(body["summary"]["net_change"], 900);
}

#[tokio::test]
async fn transactions_filter_by_type_and_direction() {
    let harness = TestHarness::new();
    seeded_history(&harness).await;

    let debits = list(&harness, "?direction=debit").await;
    assert_eq!(debits["total"], 1);
    assert_eq!(debits["summary"]["total_credited"], 0);
    assert_eq!(debits["summary"]["total_debited"], 300);

    let bonuses = list(&harness, "?type=bonus").await;
    assert_eq!(bonuses["total"], 2);
    assert_eq!(bonuses["summary"]["net_change"], 1200);

    let search = list(&harness, "?search=IMAGE_GENERATION").await;
    assert_eq!(search["total"], 1);
}

#[tokio::test]
async fn transactions_paginate() {
    let harness = TestHarness::new();
    seeded_history(&harness).await;

    let first = list(&harness, "?limit=1").await;
    assert_eq!(first["transactions"].as_array().unwrap().len(), 1);
    assert_eq!(first["total"], 3);
    assert_eq!(first["has_more"], true);
    // Summary covers every match, not just the page
    assert_eq!(first["summary"]["total_credited"], 1200);

    let last = list(&harness, "?limit=2&offset=2").await;
    assert_eq!(last["transactions"].as_array().unwrap().len(), 1);
    assert_eq!(last["has_more"], false);
}

#[tokio::test]
async fn transactions_reject_bad_filters() {
    let harness = TestHarness::new();

    harness
        .server
        .get("/v1/credits/transactions?type=free_money")
        .add_header("authorization", harness.user_auth_header())
        .await
        .assert_status_bad_request();

    harness
        .server
        .get("/v1/credits/transactions?from=2026-05-01T00:00:00Z&to=2026-04-01T00:00:00Z")
        .add_header("authorization", harness.user_auth_header())
        .await
        .assert_status_bad_request();
}

#[tokio::test]
async fn transactions_are_isolated_per_user() {
    let harness = TestHarness::new();
    seeded_history(&harness).await;

    let response = harness
        .server
        .get("/v1/credits/transactions")
        .add_header("authorization", bearer_for(&UserId::generate(), None))
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["total"], 0);
}
