//! Job lifecycle tracking and compensating refunds.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use creditline_core::{
    EntrySource, GenerationJob, JobProgress, ProcessId, Transition, UsageDetails, UserId,
};
use creditline_store::{JobUpdate, StoreError};

use crate::credits::{CreditResult, CreditService, Deduction, RefundRequest};
use crate::error::{CreditError, Result};
use crate::notify::{dispatch, JobNotification, Notifier};

/// Request to start a generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartJob {
    /// Correlation id chosen by the executor.
    pub process_id: ProcessId,
    /// Owner.
    pub user_id: UserId,
    /// Credits to reserve (0 for free jobs).
    pub credits: i64,
    /// Outputs the job will produce.
    #[serde(default = "default_expected")]
    pub expected_outputs: u32,
    /// Ledger description of the debit.
    pub description: String,
    /// Operation performed.
    pub operation_type: String,
    /// Model the job runs on.
    #[serde(default)]
    pub model_id: Option<String>,
}

fn default_expected() -> u32 {
    1
}

/// Result of starting a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStart {
    /// The job record.
    pub job: GenerationJob,
    /// The reservation, if the job costs credits.
    pub debit: Option<CreditResult>,
    /// Whether the job already existed.
    pub replayed: bool,
}

/// Idempotency key of a job's reservation.
#[must_use]
pub fn job_debit_key(process_id: &ProcessId) -> String {
    format!("job:{process_id}")
}

/// Tracks generation jobs and issues refunds for failed ones.
#[derive(Clone)]
pub struct JobTracker {
    credits: Arc<CreditService>,
    notifier: Arc<dyn Notifier>,
}

impl JobTracker {
    /// Create a tracker.
    #[must_use]
    pub fn new(credits: Arc<CreditService>, notifier: Arc<dyn Notifier>) -> Self {
        Self { credits, notifier }
    }

    /// Reserve credits for a job and record it as `processing`.
    ///
    /// Safe to repeat: the reservation is keyed by process id and an existing
    /// job is returned as a replay.
    ///
    /// # Errors
    ///
    /// `InsufficientBalance` if the reservation cannot be covered (no job is
    /// recorded), `Validation` for negative costs, `Conflict` if the process
    /// id belongs to another user.
    ///
    /// A `Storage` error after the reservation committed leaves a debit with
    /// no job behind it. Callers must retry with the same process id: the
    /// retry replays the debit and records the job, so nothing is charged
    /// twice and a later failure can still be refunded.
    pub async fn start_job(&self, request: StartJob) -> Result<JobStart> {
        if request.credits < 0 {
            return Err(CreditError::Validation(format!(
                "job cost must not be negative, got {}",
                request.credits
            )));
        }

        let store = self.credits.store();
        if let Some(existing) = store.get_job(&request.process_id)? {
            return Self::existing_start(existing, &request, None);
        }

        let debit = if request.credits > 0 {
            Some(
                self.credits
                    .deduct_credits(Deduction {
                        user_id: request.user_id,
                        amount: request.credits,
                        description: request.description.clone(),
                        usage_details: Some(UsageDetails {
                            operation_type: request.operation_type.clone(),
                            model_id: request.model_id.clone(),
                            generation_id: Some(request.process_id.to_string()),
                        }),
                        idempotency_key: Some(job_debit_key(&request.process_id)),
                    })
                    .await?,
            )
        } else {
            None
        };

        let job = GenerationJob::new(
            request.process_id.clone(),
            request.user_id,
            request.credits,
            request.expected_outputs,
            debit.map(|d| d.transaction_ref),
        );

        let created = self
            .credits
            .retry_policy()
            .run("create_job", || store.create_job(&job))
            .await;
        match created {
            Ok(()) => {
                info!(
                    process_id = %job.process_id,
                    user_id = %job.user_id,
                    credits = job.credits_used,
                    expected_outputs = job.expected_output_count,
                    "Job started"
                );
                Ok(JobStart {
                    job,
                    debit,
                    replayed: false,
                })
            }
            Err(StoreError::DuplicateJob { .. }) => {
                let existing = store.get_job(&request.process_id)?.ok_or_else(|| {
                    CreditError::NotFound {
                        entity: "job",
                        id: request.process_id.to_string(),
                    }
                })?;
                Self::existing_start(existing, &request, debit)
            }
            Err(e) => {
                if let Some(debit) = &debit {
                    error!(
                        alert = "manual_reconciliation",
                        process_id = %request.process_id,
                        user_id = %request.user_id,
                        transaction_ref = %debit.transaction_ref,
                        amount = request.credits,
                        error = %e,
                        "Job reservation committed but the job was not recorded"
                    );
                }
                Err(e.into())
            }
        }
    }

    fn existing_start(
        job: GenerationJob,
        request: &StartJob,
        debit: Option<CreditResult>,
    ) -> Result<JobStart> {
        if job.user_id != request.user_id {
            return Err(CreditError::Conflict(format!(
                "job {} belongs to a different user",
                job.process_id
            )));
        }
        Ok(JobStart {
            job,
            debit,
            replayed: true,
        })
    }

    /// Apply an executor report.
    ///
    /// On entry into `failed` the reservation is refunded before the
    /// notification is dispatched. A refund failure is logged for manual
    /// reconciliation and never fails the call; the next report for the job
    /// retries it, and a refund that goes through on such a retry is
    /// notified even though the job status did not change.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown jobs, `Storage` if the job update itself fails.
    pub async fn record_progress(
        &self,
        process_id: &ProcessId,
        progress: &JobProgress,
    ) -> Result<JobUpdate> {
        let store = self.credits.store();
        let JobUpdate {
            mut job,
            transition,
        } = self
            .credits
            .retry_policy()
            .run("update_job", || store.update_job(process_id, progress))
            .await?;

        match transition {
            Transition::Progress => {
                info!(
                    process_id = %process_id,
                    completed = job.completed_output_count,
                    failed = job.failed_output_count,
                    expected = job.expected_output_count,
                    "Job progress"
                );
            }
            Transition::Completed => {
                info!(
                    process_id = %process_id,
                    completed = job.completed_output_count,
                    failed = job.failed_output_count,
                    "Job completed"
                );
            }
            Transition::Failed => {
                warn!(process_id = %process_id, error = ?job.error, "Job failed");
            }
            Transition::Unchanged => {}
        }

        let refunded = job.needs_refund() && self.refund(&mut job).await;

        if transition != Transition::Unchanged || refunded {
            dispatch(Arc::clone(&self.notifier), JobNotification::from(&job));
        }

        Ok(JobUpdate { job, transition })
    }

    /// Issue the compensating refund for a failed job. Never fails; returns
    /// whether the refund is now on the ledger.
    async fn refund(&self, job: &mut GenerationJob) -> bool {
        let request = RefundRequest {
            user_id: job.user_id,
            amount: job.credits_used,
            description: format!("Refund for failed job {}", job.process_id),
            related_transaction_ref: job.refund_key(),
            source: EntrySource::System,
            metadata: serde_json::json!({ "process_id": job.process_id.as_str() }),
        };

        let refund = match self.credits.refund_credits(request).await {
            Ok(refund) => refund,
            Err(e) => {
                error!(
                    alert = "manual_reconciliation",
                    process_id = %job.process_id,
                    user_id = %job.user_id,
                    amount = job.credits_used,
                    error = %e,
                    "Refund for failed job did not go through"
                );
                return false;
            }
        };

        let store = self.credits.store();
        let attached = self
            .credits
            .retry_policy()
            .run("attach_refund", || {
                store.attach_refund(&job.process_id, refund.transaction_ref)
            })
            .await;
        match attached {
            Ok(updated) => *job = updated,
            Err(e) => {
                // The refund itself is committed; only the back-link is missing.
                warn!(
                    process_id = %job.process_id,
                    transaction_ref = %refund.transaction_ref,
                    error = %e,
                    "Could not link refund to job"
                );
                job.refund_transaction_ref = Some(refund.transaction_ref);
            }
        }
        true
    }

    /// Look up a job.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown jobs.
    pub fn get_job(&self, process_id: &ProcessId) -> Result<GenerationJob> {
        self.credits
            .store()
            .get_job(process_id)?
            .ok_or_else(|| CreditError::NotFound {
                entity: "job",
                id: process_id.to_string(),
            })
    }
}
