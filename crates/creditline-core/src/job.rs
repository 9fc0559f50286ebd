//! Generation job lifecycle.
//!
//! A job moves `processing -> completed` or `processing -> failed` and never
//! leaves a terminal state. Output arrival is applied as a read-modify-write
//! by the store, which calls [`GenerationJob::apply_progress`] while holding
//! the job's row lock.
//!
//! Partial outcomes: once every expected output is accounted for, the job is
//! `failed` only if none succeeded. A single successful output makes it
//! `completed`, with the failure count kept for display. An unrecoverable
//! executor error fails the job regardless of how many outputs arrived.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ProcessId, TransactionRef, UserId};

/// A tracked generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    /// External correlation id.
    pub process_id: ProcessId,

    /// Owner of the job.
    pub user_id: UserId,

    /// Lifecycle status.
    pub status: JobStatus,

    /// Credits reserved when the job started (0 for free jobs).
    pub credits_used: i64,

    /// Number of outputs the job will produce.
    pub expected_output_count: u32,

    /// Outputs that arrived successfully.
    pub completed_output_count: u32,

    /// Outputs that failed.
    pub failed_output_count: u32,

    /// Successful outputs, in arrival order.
    pub result_payload: Vec<serde_json::Value>,

    /// Terminal error, if any.
    pub error: Option<String>,

    /// Ledger entry that reserved `credits_used`.
    pub debit_transaction_ref: Option<TransactionRef>,

    /// Ledger entry that refunded the reservation.
    pub refund_transaction_ref: Option<TransactionRef>,

    /// When the job was accepted.
    pub created_at: DateTime<Utc>,

    /// When the job was last updated.
    pub updated_at: DateTime<Utc>,
}

impl GenerationJob {
    /// A new job in `processing`. At least one output is always expected.
    #[must_use]
    pub fn new(
        process_id: ProcessId,
        user_id: UserId,
        credits_used: i64,
        expected_output_count: u32,
        debit_transaction_ref: Option<TransactionRef>,
    ) -> Self {
        let now = Utc::now();
        Self {
            process_id,
            user_id,
            status: JobStatus::Processing,
            credits_used: credits_used.max(0),
            expected_output_count: expected_output_count.max(1),
            completed_output_count: 0,
            failed_output_count: 0,
            result_payload: Vec::new(),
            error: None,
            debit_transaction_ref,
            refund_transaction_ref: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the job reached `completed` or `failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self.status, JobStatus::Processing)
    }

    /// Whether a compensating refund is owed and not yet recorded.
    #[must_use]
    pub fn needs_refund(&self) -> bool {
        self.status == JobStatus::Failed
            && self.credits_used > 0
            && self.refund_transaction_ref.is_none()
    }

    /// Ledger ref the refund is keyed on.
    ///
    /// Jobs reserved through the credit service carry the debit's ref. Jobs
    /// created without one fall back to a ref derived from the process id so
    /// the refund is still unique per job.
    #[must_use]
    pub fn refund_key(&self) -> String {
        self.debit_transaction_ref
            .map_or_else(|| format!("job:{}", self.process_id), |r| r.to_string())
    }

    /// Apply an output-arrival event and report the resulting transition.
    pub fn apply_progress(&mut self, progress: &JobProgress) -> Transition {
        if self.is_terminal() {
            return Transition::Unchanged;
        }

        if let Some(total) = progress.total_expected.filter(|t| *t > 0) {
            self.expected_output_count = total;
        }

        self.result_payload
            .extend(progress.completed_outputs.iter().cloned());
        self.completed_output_count = self
            .completed_output_count
            .saturating_add(u32::try_from(progress.completed_outputs.len()).unwrap_or(u32::MAX));
        self.failed_output_count = self
            .failed_output_count
            .saturating_add(progress.failed_count);
        self.updated_at = Utc::now();

        if let Some(err) = &progress.terminal_error {
            self.status = JobStatus::Failed;
            self.error = Some(err.clone());
            return Transition::Failed;
        }

        let accounted = self
            .completed_output_count
            .saturating_add(self.failed_output_count);
        if accounted < self.expected_output_count {
            return Transition::Progress;
        }

        if self.completed_output_count == 0 {
            self.status = JobStatus::Failed;
            self.error = Some(format!(
                "all {} outputs failed",
                self.failed_output_count
            ));
            Transition::Failed
        } else {
            self.status = JobStatus::Completed;
            Transition::Completed
        }
    }
}

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Outputs still arriving.
    Processing,
    /// Finished with at least one output.
    Completed,
    /// Finished with no usable output, or aborted.
    Failed,
}

impl JobStatus {
    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// What the executor observed since its last report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    /// Outputs that finished successfully.
    #[serde(default)]
    pub completed_outputs: Vec<serde_json::Value>,
    /// Outputs that failed.
    #[serde(default)]
    pub failed_count: u32,
    /// Total outputs the job will produce, if known.
    #[serde(default)]
    pub total_expected: Option<u32>,
    /// Unrecoverable error that aborts the job.
    #[serde(default)]
    pub terminal_error: Option<String>,
}

/// Outcome of applying a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Still processing.
    Progress,
    /// Entered `completed`.
    Completed,
    /// Entered `failed`.
    Failed,
    /// Job was already terminal; nothing changed.
    Unchanged,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(expected: u32, credits: i64) -> GenerationJob {
        GenerationJob::new(
            "gen_1".parse().unwrap(),
            UserId::generate(),
            credits,
            expected,
            Some(TransactionRef::generate()),
        )
    }

    fn outputs(n: usize) -> JobProgress {
        JobProgress {
            completed_outputs: (0..n).map(|i| json!({ "url": format!("img_{i}") })).collect(),
            ..JobProgress::default()
        }
    }

    #[test]
    fn completes_when_all_outputs_arrive() {
        let mut job = job(3, 30);
        assert_eq!(job.apply_progress(&outputs(1)), Transition::Progress);
        assert_eq!(job.apply_progress(&outputs(2)), Transition::Completed);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed_output_count, 3);
        assert_eq!(job.result_payload.len(), 3);
        assert!(!job.needs_refund());
    }

    #[test]
    fn partial_failure_still_completes() {
        let mut job = job(2, 20);
        job.apply_progress(&outputs(1));
        let t = job.apply_progress(&JobProgress {
            failed_count: 1,
            ..JobProgress::default()
        });
        assert_eq!(t, Transition::Completed);
        assert_eq!(job.failed_output_count, 1);
    }

    #[test]
    fn all_outputs_failed_fails_job() {
        let mut job = job(2, 20);
        let t = job.apply_progress(&JobProgress {
            failed_count: 2,
            ..JobProgress::default()
        });
        assert_eq!(t, Transition::Failed);
        assert_eq!(job.error.as_deref(), Some("all 2 outputs failed"));
        assert!(job.needs_refund());
    }

    #[test]
    fn terminal_error_fails_even_after_partial_success() {
        let mut job = job(4, 40);
        job.apply_progress(&outputs(2));
        let t = job.apply_progress(&JobProgress {
            terminal_error: Some("model unavailable".into()),
            ..JobProgress::default()
        });
        assert_eq!(t, Transition::Failed);
        assert_eq!(job.completed_output_count, 2);
        assert!(job.needs_refund());
    }

    #[test]
    fn terminal_jobs_ignore_late_events() {
        let mut job = job(1, 10);
        job.apply_progress(&outputs(1));
        let before = job.clone();
        assert_eq!(job.apply_progress(&outputs(5)), Transition::Unchanged);
        assert_eq!(job, before);
    }

    #[test]
    fn total_expected_can_be_revised() {
        let mut job = job(1, 0);
        let t = job.apply_progress(&JobProgress {
            total_expected: Some(3),
            ..outputs(1)
        });
        assert_eq!(t, Transition::Progress);
        assert_eq!(job.expected_output_count, 3);
    }

    #[test]
    fn free_jobs_never_need_refunds() {
        let mut job = job(1, 0);
        job.apply_progress(&JobProgress {
            terminal_error: Some("boom".into()),
            ..JobProgress::default()
        });
        assert!(!job.needs_refund());
    }

    #[test]
    fn refund_key_falls_back_to_process_id() {
        let mut job = job(1, 10);
        let debit = job.debit_transaction_ref.unwrap();
        assert_eq!(job.refund_key(), debit.to_string());

        job.debit_transaction_ref = None;
        assert_eq!(job.refund_key(), "job:gen_1");
    }
}
