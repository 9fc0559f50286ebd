//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{admin, credits, health, jobs, webhooks};
use crate::state::AppState;

// ============================================================================
// Concurrency Limiting Constants
// ============================================================================

/// Maximum concurrent requests for job executor endpoints.
const JOBS_MAX_CONCURRENT_REQUESTS: usize = 100;

/// Maximum concurrent requests for general API endpoints.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
///
/// ## Credits (JWT auth)
/// - `GET /v1/credits/balance` - Reconcile, then get current balance
/// - `GET /v1/credits/transactions` - Filtered transaction history
/// - `GET /v1/subscription` - Cached subscription
///
/// ## Jobs (Service API Key auth)
/// - `POST /v1/jobs` - Start a job and reserve credits
/// - `POST /v1/jobs/:process_id/progress` - Report outputs or failure
/// - `GET /v1/jobs/:process_id` - Get a job
/// - `GET /v1/users/:user_id/balance` - Cached balance of a user
///
/// ## Admin (Admin API Key auth)
/// - `POST /v1/admin/credits/add` - Manual grant
/// - `POST /v1/admin/credits/reverse` - Reverse a ledger entry
/// - `GET /v1/admin/users/:user_id/verify` - Compare cache and ledger
/// - `POST /v1/admin/users/:user_id/rebuild` - Reset cache to ledger
///
/// ## Webhooks (Signature verification)
/// - `POST /webhooks/paddle` - Paddle webhooks
pub fn create_router(state: AppState) -> Router {
    // Extract config values before moving state
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;

    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);

    // Executors report every output, so job routes get a higher limit.
    let job_routes = Router::new()
        .route("/", post(jobs::start_job))
        .route("/:process_id", get(jobs::get_job))
        .route("/:process_id/progress", post(jobs::report_progress))
        .layer(ConcurrencyLimitLayer::new(JOBS_MAX_CONCURRENT_REQUESTS));

    let admin_routes = Router::new()
        .route("/credits/add", post(admin::add_credits))
        .route("/credits/reverse", post(admin::reverse_transaction))
        .route("/users/:user_id/verify", get(admin::verify_balance))
        .route("/users/:user_id/rebuild", post(admin::rebuild_balance));

    let api_routes = Router::new()
        .route("/credits/balance", get(credits::get_balance))
        .route("/credits/transactions", get(credits::list_transactions))
        .route("/subscription", get(credits::get_subscription))
        .route("/users/:user_id/balance", get(credits::get_user_balance))
        .nest("/jobs", job_routes)
        .nest("/admin", admin_routes)
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS));

    Router::new()
        // Health (public, no rate limit)
        .route("/health", get(health::health))
        // API v1 routes (rate limited)
        .nest("/v1", api_routes)
        // Webhooks (no rate limit - controlled by Paddle)
        .route("/webhooks/paddle", post(webhooks::paddle_webhook))
        // Global middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
