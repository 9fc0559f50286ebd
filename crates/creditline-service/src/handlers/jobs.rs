//! Job executor handlers.
//!
//! Executors authenticate with the service API key. They start a job (which
//! reserves its credits), stream progress as outputs arrive and may read the
//! job back at any time.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use creditline_core::{GenerationJob, JobProgress, ProcessId, Transition, UserId};
use creditline_engine::StartJob;

use crate::auth::ServiceAuth;
use crate::error::ApiError;
use crate::state::AppState;

/// Start job request.
#[derive(Debug, Deserialize)]
pub struct StartJobRequest {
    /// Correlation id chosen by the executor.
    pub process_id: String,
    /// Owner of the job.
    pub user_id: String,
    /// Credits to reserve (0 for free jobs).
    pub credits: i64,
    /// Outputs the job will produce.
    #[serde(default = "default_expected_outputs")]
    pub expected_outputs: u32,
    /// Operation performed (e.g. `image_generation`).
    pub operation_type: String,
    /// Model the job runs on.
    #[serde(default)]
    pub model_id: Option<String>,
    /// Ledger description; generated when absent.
    #[serde(default)]
    pub description: Option<String>,
}

fn default_expected_outputs() -> u32 {
    1
}

/// Start job response.
#[derive(Debug, Serialize)]
pub struct StartJobResponse {
    /// The job.
    pub job: GenerationJob,
    /// Balance after the reservation (absent for free jobs).
    pub balance: Option<i64>,
    /// Whether the job already existed.
    pub replayed: bool,
}

/// Start a job and reserve its credits.
///
/// Returns 201 for a new job and 200 when the process id was already started
/// by the same user.
pub async fn start_job(
    State(state): State<Arc<AppState>>,
    service: ServiceAuth,
    Json(body): Json<StartJobRequest>,
) -> Result<(StatusCode, Json<StartJobResponse>), ApiError> {
    let process_id: ProcessId = body.process_id.parse()?;
    let user_id: UserId = body.user_id.parse()?;
    if body.expected_outputs == 0 {
        return Err(ApiError::BadRequest(
            "expected_outputs must be at least 1".into(),
        ));
    }

    let description = body
        .description
        .unwrap_or_else(|| format!("{} ({process_id})", body.operation_type));

    tracing::debug!(
        service = %service.service_name,
        process_id = %process_id,
        user_id = %user_id,
        credits = body.credits,
        "Starting job"
    );

    let start = state
        .jobs
        .start_job(StartJob {
            process_id,
            user_id,
            credits: body.credits,
            expected_outputs: body.expected_outputs,
            description,
            operation_type: body.operation_type,
            model_id: body.model_id,
        })
        .await?;

    let status = if start.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };

    Ok((
        status,
        Json(StartJobResponse {
            balance: start.debit.map(|d| d.balance),
            job: start.job,
            replayed: start.replayed,
        }),
    ))
}

/// Progress response.
#[derive(Debug, Serialize)]
pub struct ProgressResponse {
    /// The job after the update.
    pub job: GenerationJob,
    /// `progress`, `completed`, `failed` or `unchanged`.
    pub transition: &'static str,
}

fn transition_name(transition: Transition) -> &'static str {
    match transition {
        Transition::Progress => "progress",
        Transition::Completed => "completed",
        Transition::Failed => "failed",
        Transition::Unchanged => "unchanged",
    }
}

/// Report job progress.
///
/// Reports for a job that has already finished are accepted and change
/// nothing.
pub async fn report_progress(
    State(state): State<Arc<AppState>>,
    _service: ServiceAuth,
    Path(process_id): Path<String>,
    Json(progress): Json<JobProgress>,
) -> Result<Json<ProgressResponse>, ApiError> {
    let process_id: ProcessId = process_id.parse()?;
    let update = state.jobs.record_progress(&process_id, &progress).await?;

    Ok(Json(ProgressResponse {
        job: update.job,
        transition: transition_name(update.transition),
    }))
}

/// Get a job.
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    _service: ServiceAuth,
    Path(process_id): Path<String>,
) -> Result<Json<GenerationJob>, ApiError> {
    let process_id: ProcessId = process_id.parse()?;
    Ok(Json(state.jobs.get_job(&process_id)?))
}
