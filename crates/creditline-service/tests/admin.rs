//! Admin API integration tests.

mod common;

use axum::http::StatusCode;
use common::TestHarness;
use serde_json::{json, Value};

async fn grant(harness: &TestHarness, amount: i64, key: Option<&str>) -> Value {
    let response = harness
        .server
        .post("/v1/admin/credits/add")
        .add_header("x-admin-key", &harness.admin_api_key)
        .add_header("x-admin-id", "ops@example.com")
        .json(&json!({
            "user_id": harness.test_user_id.to_string(),
            "amount": amount,
            "description": "Goodwill credit",
            "idempotency_key": key
        }))
        .await;
    response.assert_status_ok();
    response.json()
}

async fn reverse(harness: &TestHarness, transaction_ref: &str) -> axum_test::TestResponse {
    harness
        .server
        .post("/v1/admin/credits/reverse")
        .add_header("x-admin-key", &harness.admin_api_key)
        .json(&json!({
            "transaction_ref": transaction_ref,
            "reason": "granted by mistake"
        }))
        .await
}

// ============================================================================
// Grants
// ============================================================================

#[tokio::test]
async fn admin_grant_defaults_to_manual_adjustment() {
    let harness = TestHarness::new();

    let result = grant(&harness, 400, None).await;
    assert_eq!(result["balance"], 400);
    assert_eq!(result["amount"], 400);
    assert_eq!(result["replayed"], false);

    let history = harness
        .server
        .get("/v1/credits/transactions?type=manual_adjustment")
        .add_header("authorization", harness.user_auth_header())
        .await;
    assert_eq!(history.json::<Value>()["total"], 1);
}

#[tokio::test]
async fn admin_grant_with_key_applies_once() {
    let harness = TestHarness::new();

    let first = grant(&harness, 250, Some("ticket-4411")).await;
    let second = grant(&harness, 250, Some("ticket-4411")).await;

    assert_eq!(second["replayed"], true);
    assert_eq!(second["transaction_ref"], first["transaction_ref"]);
    assert_eq!(harness.balance().await, 250);
}

#[tokio::test]
async fn admin_grant_rejects_bad_input() {
    let harness = TestHarness::new();

    for amount in [0, -10] {
        harness
            .server
            .post("/v1/admin/credits/add")
            .add_header("x-admin-key", &harness.admin_api_key)
            .json(&json!({
                "user_id": harness.test_user_id.to_string(),
                "amount": amount,
                "description": "nope"
            }))
            .await
            .assert_status_bad_request();
    }

    // Debit types go through their own operations
    harness
        .server
        .post("/v1/admin/credits/add")
        .add_header("x-admin-key", &harness.admin_api_key)
        .json(&json!({
            "user_id": harness.test_user_id.to_string(),
            "amount": 10,
            "entry_type": "usage_deduction",
            "description": "nope"
        }))
        .await
        .assert_status_bad_request();
}

#[tokio::test]
async fn admin_routes_require_admin_key() {
    let harness = TestHarness::new();

    harness
        .server
        .post("/v1/admin/credits/add")
        .add_header("x-admin-key", "guess")
        .json(&json!({
            "user_id": harness.test_user_id.to_string(),
            "amount": 10,
            "description": "nope"
        }))
        .await
        .assert_status_unauthorized();

    // The service key is not an admin key
    harness
        .server
        .get(&format!("/v1/admin/users/{}/verify", harness.test_user_id))
        .add_header("x-admin-key", &harness.service_api_key)
        .await
        .assert_status_unauthorized();
}

// ============================================================================
// Reversal
// ============================================================================

#[tokio::test]
async fn reversal_rolls_back_and_replays() {
    let harness = TestHarness::new();
    let granted = grant(&harness, 500, None).await;
    let transaction_ref = granted["transaction_ref"].as_str().unwrap().to_string();

    let first = reverse(&harness, &transaction_ref).await;
    first.assert_status_ok();
    let first: Value = first.json();
    assert_eq!(first["amount"], -500);
    assert_eq!(first["balance"], 0);
    assert_eq!(first["replayed"], false);

    let again = reverse(&harness, &transaction_ref).await;
    again.assert_status_ok();
    let again: Value = again.json();
    assert_eq!(again["replayed"], true);
    assert_eq!(again["transaction_ref"], first["transaction_ref"]);
    assert_eq!(harness.balance().await, 0);

    let history = harness
        .server
        .get("/v1/credits/transactions")
        .add_header("authorization", harness.user_auth_header())
        .await;
    let history: Value = history.json();
    let entries = history["transactions"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["type"], "rollback");
    assert_eq!(entries[0]["related_transaction_ref"], transaction_ref.as_str());
    assert_eq!(entries[1]["status"], "reversed");
}

#[tokio::test]
async fn reversing_spent_credits_is_refused() {
    let harness = TestHarness::new();
    let granted = grant(&harness, 500, None).await;
    harness
        .start_job("gen_spend", 400, 1)
        .await
        .assert_status(StatusCode::CREATED);

    let response = reverse(&harness, granted["transaction_ref"].as_str().unwrap()).await;
    response.assert_status(StatusCode::PAYMENT_REQUIRED);
    assert_eq!(harness.balance().await, 100);
}

#[tokio::test]
async fn reversal_of_unknown_or_malformed_refs() {
    let harness = TestHarness::new();

    reverse(&harness, "01HZZZZZZZZZZZZZZZZZZZZZZZ")
        .await
        .assert_status_not_found();

    reverse(&harness, "not-a-ref").await.assert_status_bad_request();
}

// ============================================================================
// Verification
// ============================================================================

#[tokio::test]
async fn verify_and_rebuild_a_consistent_balance() {
    let harness = TestHarness::new();
    grant(&harness, 900, None).await;
    harness
        .start_job("gen_verify", 150, 1)
        .await
        .assert_status(StatusCode::CREATED);

    let verify = harness
        .server
        .get(&format!("/v1/admin/users/{}/verify", harness.test_user_id))
        .add_header("x-admin-key", &harness.admin_api_key)
        .await;
    verify.assert_status_ok();
    let check: Value = verify.json();
    assert_eq!(check["is_valid"], true);
    assert_eq!(check["stored_balance"], 750);
    assert_eq!(check["calculated_balance"], 750);
    assert_eq!(check["discrepancy"], 0);

    let rebuild = harness
        .server
        .post(&format!("/v1/admin/users/{}/rebuild", harness.test_user_id))
        .add_header("x-admin-key", &harness.admin_api_key)
        .await;
    rebuild.assert_status_ok();
    let rebuilt: Value = rebuild.json();
    assert_eq!(rebuilt["previous"], 750);
    assert_eq!(rebuilt["rebuilt"], 750);
    assert_eq!(rebuilt["changed"], false);
}

#[tokio::test]
async fn verify_rejects_malformed_user_id() {
    let harness = TestHarness::new();

    harness
        .server
        .get("/v1/admin/users/not-a-uuid/verify")
        .add_header("x-admin-key", &harness.admin_api_key)
        .await
        .assert_status_bad_request();
}
