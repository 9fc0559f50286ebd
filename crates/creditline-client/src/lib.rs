//! Creditline Client SDK.
//!
//! This crate provides a client library for job executors to reserve credits,
//! report progress and read balances through the creditline API.
//!
//! # Example
//!
//! ```no_run
//! use creditline_client::{ClientOptions, CreditlineClient, StartJobRequest};
//! use creditline_core::{JobProgress, ProcessId};
//!
//! # async fn example() -> Result<(), creditline_client::ClientError> {
//! let client = CreditlineClient::with_options(
//!     "http://creditline.billing.svc:8080",
//!     "your-service-api-key",
//!     ClientOptions::with_service_name("image-worker"),
//! )?;
//!
//! let started = client.start_job(&StartJobRequest {
//!     process_id: "gen_123".to_string(),
//!     user_id: "5f0c4a9e-8d5e-4c52-9a0b-3f1f2a6c7d11".to_string(),
//!     credits: 40,
//!     expected_outputs: 4,
//!     operation_type: "image_generation".to_string(),
//!     model_id: Some("diffusion-xl".to_string()),
//!     description: None,
//! }).await?;
//!
//! let process_id: ProcessId = "gen_123".parse().expect("valid process id");
//! client.report_progress(&process_id, &JobProgress {
//!     completed_outputs: vec![serde_json::json!({ "url": "https://cdn.example.com/1.png" })],
//!     ..JobProgress::default()
//! }).await?;
//!
//! println!("Reserved {} credits", started.job.credits_used);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod client;
mod error;
mod types;

pub use client::{ClientOptions, CreditlineClient};
pub use error::ClientError;
pub use types::*;
