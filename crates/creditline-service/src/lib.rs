//! Creditline HTTP API service.
//!
//! This crate exposes the credit engine over HTTP:
//!
//! - Balance, subscription and ledger reads for end users
//! - Job start and progress reporting for job executors
//! - Paddle billing webhooks
//! - Admin operations (manual grants, reversals, verification, rebuilds)
//!
//! # Authentication
//!
//! 1. **HS256 JWT bearer tokens** for end-user requests
//! 2. **Service API key** (`X-API-Key`) for job executors
//! 3. **Admin API key** (`X-Admin-Key`) for admin endpoints
//!
//! Webhooks authenticate by signature instead.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::unused_async)] // Handlers need async for routing

pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod notify;
pub mod paddle;
pub mod routes;
pub mod state;

pub use config::{ConfigError, ServiceConfig, StorageBackend};
pub use error::ApiError;
pub use notify::HttpNotifier;
pub use paddle::PaddleClient;
pub use routes::create_router;
pub use state::AppState;
