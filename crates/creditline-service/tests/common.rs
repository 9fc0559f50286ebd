//! Common test utilities for creditline integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::Arc;

use axum::Router;
use axum_test::{TestResponse, TestServer};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};

use creditline_core::UserId;
use creditline_service::auth::JwtClaims;
use creditline_service::crypto::sign;
use creditline_service::{create_router, AppState, ServiceConfig, StorageBackend};
use creditline_store::MemoryStore;

pub const JWT_SECRET: &str = "test-jwt-secret";
pub const SERVICE_API_KEY: &str = "test-service-key";
pub const ADMIN_API_KEY: &str = "test-admin-key";
pub const WEBHOOK_SECRET: &str = "pdl_ntfset_test";

/// Configuration every test starts from.
pub fn test_config() -> ServiceConfig {
    ServiceConfig {
        listen_addr: "127.0.0.1:0".into(),
        storage_backend: StorageBackend::Memory,
        jwt_secret: Some(JWT_SECRET.into()),
        service_api_key: Some(SERVICE_API_KEY.into()),
        admin_api_key: Some(ADMIN_API_KEY.into()),
        paddle_webhook_secret: Some(WEBHOOK_SECRET.into()),
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        ..ServiceConfig::default()
    }
}

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The test server for making HTTP requests.
    pub server: TestServer,
    /// The store behind the server.
    pub store: Arc<MemoryStore>,
    /// A test user ID for authenticated requests.
    pub test_user_id: UserId,
    /// The service API key for executor requests.
    pub service_api_key: String,
    /// The admin API key.
    pub admin_api_key: String,
}

impl TestHarness {
    /// Create a new test harness with a fresh store.
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Create a harness with a custom configuration.
    pub fn with_config(config: ServiceConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let state = AppState::new(store.clone(), config);
        let router: Router = create_router(state);

        let server = TestServer::new(router).expect("Failed to create test server");

        Self {
            server,
            store,
            test_user_id: UserId::generate(),
            service_api_key: SERVICE_API_KEY.to_string(),
            admin_api_key: ADMIN_API_KEY.to_string(),
        }
    }

    /// Get the authorization header for user authentication.
    pub fn user_auth_header(&self) -> String {
        bearer_for(&self.test_user_id, None)
    }

    /// Authorization header whose token carries an email claim.
    pub fn user_auth_header_with_email(&self, email: &str) -> String {
        bearer_for(&self.test_user_id, Some(email))
    }

    /// Grant credits to the test user through the admin API.
    pub async fn fund(&self, amount: i64) {
        self.server
            .post("/v1/admin/credits/add")
            .add_header("x-admin-key", &self.admin_api_key)
            .json(&json!({
                "user_id": self.test_user_id.to_string(),
                "amount": amount,
                "entry_type": "bonus",
                "description": "Test funding"
            }))
            .await
            .assert_status_ok();
    }

    /// Read the test user's balance.
    pub async fn balance(&self) -> i64 {
        let response = self
            .server
            .get("/v1/credits/balance")
            .add_header("authorization", self.user_auth_header())
            .await;
        response.assert_status_ok();
        response.json::<Value>()["credits"]
            .as_i64()
            .expect("credits missing")
    }

    /// Start a job for the test user.
    pub async fn start_job(&self, process_id: &str, credits: i64, expected_outputs: u32) -> TestResponse {
        self.server
            .post("/v1/jobs")
            .add_header("x-api-key", &self.service_api_key)
            .add_header("x-service-name", "image-worker")
            .json(&json!({
                "process_id": process_id,
                "user_id": self.test_user_id.to_string(),
                "credits": credits,
                "expected_outputs": expected_outputs,
                "operation_type": "image_generation",
                "model_id": "diffusion-xl"
            }))
            .await
    }

    /// Report progress for a job.
    pub async fn report(&self, process_id: &str, progress: Value) -> TestResponse {
        self.server
            .post(&format!("/v1/jobs/{process_id}/progress"))
            .add_header("x-api-key", &self.service_api_key)
            .json(&progress)
            .await
    }

    /// Deliver a correctly signed Paddle webhook.
    pub async fn signed_webhook(&self, payload: &Value) -> TestResponse {
        let body = payload.to_string();
        let signature = sign(WEBHOOK_SECRET, chrono::Utc::now().timestamp(), body.as_bytes())
            .expect("Failed to sign payload");
        self.server
            .post("/webhooks/paddle")
            .add_header("paddle-signature", signature)
            .add_header("content-type", "application/json")
            .text(body)
            .await
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Mint an HS256 bearer header for `user_id`.
pub fn bearer_for(user_id: &UserId, email: Option<&str>) -> String {
    let claims = JwtClaims {
        sub: user_id.to_string(),
        email: email.map(str::to_string),
        exp: chrono::Utc::now().timestamp() + 3600,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("Failed to encode token");
    format!("Bearer {token}")
}

/// A `transaction.completed` webhook payload.
pub fn transaction_completed(
    txn_id: &str,
    user_id: &UserId,
    customer_id: &str,
    subscription_id: Option<&str>,
    prices: &[&str],
) -> Value {
    let items: Vec<Value> = prices
        .iter()
        .map(|p| json!({"price": {"id": p}, "quantity": 1}))
        .collect();
    json!({
        "event_id": format!("evt_{txn_id}"),
        "event_type": "transaction.completed",
        "occurred_at": "2026-03-01T10:00:00Z",
        "data": {
            "id": txn_id,
            "status": "completed",
            "customer_id": customer_id,
            "subscription_id": subscription_id,
            "origin": "web",
            "items": items,
            "billed_at": "2026-03-01T10:00:00Z",
            "custom_data": {"user_id": user_id.to_string()}
        }
    })
}

/// A subscription webhook payload.
pub fn subscription_event(
    event_type: &str,
    subscription_id: &str,
    user_id: &UserId,
    customer_id: &str,
    status: &str,
    price: &str,
) -> Value {
    json!({
        "event_id": format!("evt_{subscription_id}_{event_type}"),
        "event_type": event_type,
        "occurred_at": "2026-03-01T10:00:00Z",
        "data": {
            "id": subscription_id,
            "status": status,
            "customer_id": customer_id,
            "items": [{"price": {"id": price}, "quantity": 1}],
            "current_billing_period": {
                "starts_at": "2026-03-01T10:00:00Z",
                "ends_at": "2026-04-01T10:00:00Z"
            },
            "next_billed_at": "2026-04-01T10:00:00Z",
            "custom_data": {"user_id": user_id.to_string()}
        }
    })
}
