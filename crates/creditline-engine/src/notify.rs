//! Real-time job status notifications.
//!
//! Delivery is best-effort and runs on its own task after the accounting
//! work has committed. A failed notification is logged and dropped.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use creditline_core::{GenerationJob, JobStatus};

/// Message pushed to the real-time channel after a job update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobNotification {
    /// Job correlation id.
    pub process_id: String,
    /// Job status after the update.
    pub status: JobStatus,
    /// Outputs so far (absent for failed jobs).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Terminal error (failed jobs only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&GenerationJob> for JobNotification {
    fn from(job: &GenerationJob) -> Self {
        let (payload, error) = match job.status {
            JobStatus::Failed => (None, job.error.clone()),
            JobStatus::Processing | JobStatus::Completed => {
                (Some(serde_json::Value::from(job.result_payload.clone())), None)
            }
        };
        Self {
            process_id: job.process_id.to_string(),
            status: job.status,
            payload,
            error,
        }
    }
}

/// Error returned by a notifier.
#[derive(Debug, thiserror::Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Delivers job notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notification.
    async fn notify(&self, notification: &JobNotification) -> Result<(), NotifyError>;
}

/// Notifier that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, notification: &JobNotification) -> Result<(), NotifyError> {
        debug!(process_id = %notification.process_id, "No notifier configured, dropping notification");
        Ok(())
    }
}

/// Deliver `notification` on a spawned task. Never blocks the caller and
/// never reports failure back.
pub fn dispatch(notifier: Arc<dyn Notifier>, notification: JobNotification) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&notification).await {
            warn!(
                process_id = %notification.process_id,
                status = notification.status.as_str(),
                error = %e,
                "Job notification failed"
            );
        }
    })
}
