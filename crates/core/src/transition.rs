//! Job lifecycle state machine.
//!
//! Every change to a job's lifecycle fields is expressed as a `Transition`.
//! Stores apply a transition only when the job's current status matches the
//! status the caller expected (compare-and-swap), so a transition value is
//! the single description of "what changes" shared by all store backends.
//!
//! ```text
//! pending --claim--> processing --complete--> completed
//!    |                  |   \----retry------> pending
//!    |                  |    \---fail-------> failed --requeue--> pending
//!    |--reject--> failed \---cancel--> cancelled
//!    \--cancel--> cancelled
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::failure::JobFailure;
use crate::job::{Job, JobStatus};

/// A lifecycle change applied to a single job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    /// `pending -> processing`: start a new attempt.
    Claim { at: DateTime<Utc> },
    /// `processing -> completed`: the handler succeeded.
    Complete {
        result: serde_json::Value,
        at: DateTime<Utc>,
    },
    /// `processing -> pending`: the handler failed with attempts remaining.
    ScheduleRetry {
        failure: JobFailure,
        retry_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    /// `processing -> failed`: the handler failed on its last attempt.
    Fail {
        failure: JobFailure,
        at: DateTime<Utc>,
    },
    /// `pending -> failed`: no handler is registered for the job type.
    Reject { message: String, at: DateTime<Utc> },
    /// `pending | processing -> cancelled`.
    Cancel { at: DateTime<Utc> },
    /// `failed -> pending`: manual retry with a fresh attempt budget.
    Requeue { at: DateTime<Utc> },
    /// Progress report while `processing`; the status is unchanged.
    Progress {
        percent: u8,
        message: Option<String>,
        at: DateTime<Utc>,
    },
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Claim { .. } => "claim",
            Transition::Complete { .. } => "complete",
            Transition::ScheduleRetry { .. } => "schedule_retry",
            Transition::Fail { .. } => "fail",
            Transition::Reject { .. } => "reject",
            Transition::Cancel { .. } => "cancel",
            Transition::Requeue { .. } => "requeue",
            Transition::Progress { .. } => "progress",
        }
    }

    /// Status the job has after the transition.
    pub fn target(&self) -> JobStatus {
        match self {
            Transition::Claim { .. } | Transition::Progress { .. } => JobStatus::Processing,
            Transition::Complete { .. } => JobStatus::Completed,
            Transition::ScheduleRetry { .. } | Transition::Requeue { .. } => JobStatus::Pending,
            Transition::Fail { .. } | Transition::Reject { .. } => JobStatus::Failed,
            Transition::Cancel { .. } => JobStatus::Cancelled,
        }
    }

    /// Whether the transition is defined from `from`.
    pub fn permits_from(&self, from: JobStatus) -> bool {
        match self {
            Transition::Claim { .. } | Transition::Reject { .. } => from == JobStatus::Pending,
            Transition::Complete { .. }
            | Transition::ScheduleRetry { .. }
            | Transition::Fail { .. }
            | Transition::Progress { .. } => from == JobStatus::Processing,
            Transition::Cancel { .. } => {
                matches!(from, JobStatus::Pending | JobStatus::Processing)
            }
            Transition::Requeue { .. } => from == JobStatus::Failed,
        }
    }

    /// Reject transitions that are not edges of the lifecycle.
    pub fn check_from(&self, from: JobStatus) -> DomainResult<()> {
        if self.permits_from(from) {
            Ok(())
        } else {
            Err(DomainError::invalid_transition(format!(
                "{} is not allowed from {}",
                self.name(),
                from
            )))
        }
    }

    /// Apply the transition to an in-memory job record.
    pub fn apply(&self, job: &mut Job) -> DomainResult<()> {
        self.check_from(job.status)?;

        match self {
            Transition::Claim { at } => {
                job.attempts = job.attempts.saturating_add(1);
                job.started_at.get_or_insert(*at);
                job.last_attempt_at = Some(*at);
                // Progress is per attempt.
                job.progress = 0;
                job.progress_message = None;
                job.updated_at = *at;
            }
            Transition::Complete { result, at } => {
                job.completed_at = Some(*at);
                job.progress = 100;
                job.result = Some(result.clone());
                job.next_retry_at = None;
                job.updated_at = *at;
            }
            Transition::ScheduleRetry {
                failure,
                retry_at,
                at,
            } => {
                job.error_message = Some(failure.message.clone());
                job.stack_trace = failure.stack_trace.clone();
                job.next_retry_at = Some(*retry_at);
                job.updated_at = *at;
            }
            Transition::Fail { failure, at } => {
                job.error_message = Some(failure.message.clone());
                job.stack_trace = failure.stack_trace.clone();
                job.next_retry_at = None;
                job.completed_at = Some(*at);
                job.updated_at = *at;
            }
            Transition::Reject { message, at } => {
                job.error_message = Some(message.clone());
                job.stack_trace = None;
                job.completed_at = Some(*at);
                job.updated_at = *at;
            }
            Transition::Cancel { at } => {
                job.completed_at = Some(*at);
                job.next_retry_at = None;
                job.updated_at = *at;
            }
            Transition::Requeue { at } => {
                job.attempts = 0;
                job.error_message = None;
                job.stack_trace = None;
                job.next_retry_at = None;
                job.completed_at = None;
                job.progress = 0;
                job.progress_message = None;
                job.updated_at = *at;
            }
            Transition::Progress {
                percent,
                message,
                at,
            } => {
                job.progress = (*percent).min(100);
                if message.is_some() {
                    job.progress_message = message.clone();
                }
                job.updated_at = *at;
            }
        }

        job.status = self.target();
        Ok(())
    }
}
