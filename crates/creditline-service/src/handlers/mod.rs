//! API handlers.

pub mod admin;
pub mod credits;
pub mod health;
pub mod jobs;
pub mod webhooks;
