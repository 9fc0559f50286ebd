//! Request and response types for the creditline client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use creditline_core::GenerationJob;

/// Start job request.
#[derive(Debug, Clone, Serialize)]
pub struct StartJobRequest {
    /// Correlation id chosen by the executor.
    pub process_id: String,
    /// Owner of the job.
    pub user_id: String,
    /// Credits to reserve (0 for free jobs).
    pub credits: i64,
    /// Outputs the job will produce.
    pub expected_outputs: u32,
    /// Operation performed (e.g. `"image_generation"`).
    pub operation_type: String,
    /// Model the job runs on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    /// Ledger description. The service generates one when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Start job response.
#[derive(Debug, Clone, Deserialize)]
pub struct StartJobResponse {
    /// The job as recorded.
    pub job: GenerationJob,
    /// Balance after the reservation (absent for free jobs and replays).
    pub balance: Option<i64>,
    /// Whether the process id had already been started.
    pub replayed: bool,
}

/// Progress response.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressResponse {
    /// The job after the update.
    pub job: GenerationJob,
    /// What the report did to the job.
    pub transition: ProgressTransition,
}

/// Outcome of a progress report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressTransition {
    /// The job is still processing.
    Progress,
    /// The job completed.
    Completed,
    /// The job failed and its credits were refunded.
    Failed,
    /// The job was already finished.
    Unchanged,
}

/// How the service reconciled a balance read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Nothing looked stale.
    Skipped,
    /// Reconciled against the billing provider.
    Synced,
    /// Billing provider unreachable; cached balance.
    Degraded,
    /// Reconciliation failed; cached balance.
    Failed,
}

/// Balance response.
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceResponse {
    /// User ID.
    pub user_id: String,
    /// Spendable credits.
    pub credits: i64,
    /// Current plan.
    pub plan: String,
    /// Whether the subscription is active or trialing.
    pub has_active_subscription: bool,
    /// Last successful reconciliation.
    pub balance_verified_at: Option<DateTime<Utc>>,
    /// What reconciliation did on this read.
    pub sync: SyncStatus,
}

/// API error response.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    /// Error details.
    pub error: ApiErrorDetails,
}

/// API error details.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorDetails {
    /// Error code.
    pub code: String,
    /// Error message.
    pub message: String,
    /// Additional details.
    pub details: Option<serde_json::Value>,
}
