//! Paddle integration.
//!
//! Paddle is the system of record for subscriptions and charges:
//! - Customer lookup and creation
//! - Active subscription listing for reconciliation
//! - Latest transaction per subscription
//! - Webhook payload decoding

pub mod client;
pub mod types;

pub use client::PaddleClient;
pub use types::*;
