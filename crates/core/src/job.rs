//! The job record and its creation input.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, OwnerId};
use crate::payload::JobPayload;

/// Attempts allowed when a job does not specify its own limit.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Largest `max_attempts` a job may carry; attempt counters are stored as
/// 32-bit signed integers.
pub const MAX_ATTEMPTS_LIMIT: u32 = i32::MAX as u32;

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be dispatched (new, or waiting for a retry).
    Pending,
    /// Claimed by a dispatcher; the handler is running.
    Processing,
    /// Handler succeeded.
    Completed,
    /// Attempts exhausted or no handler registered.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// No automatic transition leaves a terminal status.
    ///
    /// `Failed` counts as terminal even though a manual retry can requeue it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the lifecycle has an edge from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Pending)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Failed, Pending)
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Description of a job to enqueue.
///
/// Unset fields are defaulted when the job is materialized: `scheduled_for`
/// to the creation time, `max_attempts` to the configured default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub name: String,
    pub payload: JobPayload,
    pub priority: i32,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub max_attempts: Option<u32>,
    pub owner_id: Option<OwnerId>,
}

impl NewJob {
    pub fn new(
        job_type: impl Into<String>,
        name: impl Into<String>,
        payload: impl Into<JobPayload>,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            name: name.into(),
            payload: payload.into(),
            priority: 0,
            scheduled_for: None,
            max_attempts: None,
            owner_id: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn owner(mut self, owner_id: OwnerId) -> Self {
        self.owner_id = Some(owner_id);
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.job_type.trim().is_empty() {
            return Err(DomainError::validation("job type must not be empty"));
        }
        if let Some(max_attempts) = self.max_attempts {
            check_max_attempts(max_attempts)?;
        }
        Ok(())
    }
}

fn check_max_attempts(max_attempts: u32) -> DomainResult<()> {
    if max_attempts == 0 {
        return Err(DomainError::validation("max_attempts must be at least 1"));
    }
    if max_attempts > MAX_ATTEMPTS_LIMIT {
        return Err(DomainError::validation(format!(
            "max_attempts must not exceed {MAX_ATTEMPTS_LIMIT}"
        )));
    }
    Ok(())
}

/// A persisted unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub name: String,
    pub payload: JobPayload,
    pub priority: i32,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest time the job may run.
    pub scheduled_for: DateTime<Utc>,
    /// Set after a retryable failure; the job is not due before this.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: u8,
    pub progress_message: Option<String>,
    pub error_message: Option<String>,
    pub stack_trace: Option<String>,
    pub result: Option<serde_json::Value>,
    pub owner_id: Option<OwnerId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Materialize a validated `NewJob` as a fresh `pending` job.
    pub fn from_new(
        new_job: NewJob,
        now: DateTime<Utc>,
        default_max_attempts: u32,
    ) -> DomainResult<Self> {
        new_job.validate()?;
        let max_attempts = new_job.max_attempts.unwrap_or(default_max_attempts);
        check_max_attempts(max_attempts)?;

        Ok(Self {
            id: JobId::new(),
            job_type: new_job.job_type,
            name: new_job.name,
            payload: new_job.payload,
            priority: new_job.priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            scheduled_for: new_job.scheduled_for.unwrap_or(now),
            next_retry_at: None,
            started_at: None,
            last_attempt_at: None,
            completed_at: None,
            progress: 0,
            progress_message: None,
            error_message: None,
            stack_trace: None,
            result: None,
            owner_id: new_job.owner_id,
            created_at: now,
            updated_at: now,
        })
    }

    /// Whether the dispatcher may pick the job up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && self.scheduled_for <= now
            && self.next_retry_at.is_none_or(|at| at <= now)
    }

    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            id: self.id,
            status: self.status,
            progress: self.progress,
            progress_message: self.progress_message.clone(),
            error: self.error_message.clone(),
            result: self.result.clone(),
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            next_retry_at: self.next_retry_at,
        }
    }
}

/// Caller-facing snapshot of a job's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub progress_message: Option<String>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
}
