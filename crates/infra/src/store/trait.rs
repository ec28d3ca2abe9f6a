use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use jobforge_core::{DomainError, Job, JobId, JobStatus, Transition};

/// Job store operation error.
///
/// These are **infrastructure errors** (storage, serialization, misuse of the
/// lifecycle). A compare-and-swap miss is not an error; see
/// [`JobStore::transition`].
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    #[error(transparent)]
    InvalidTransition(#[from] DomainError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: u64) {
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Processing => &mut self.processing,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        };
        *slot += count;
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.cancelled
    }
}

/// Durable job storage.
///
/// The store is the **single source of truth** and the only coordination
/// point between dispatchers. All lifecycle changes go through
/// [`transition`](JobStore::transition), a compare-and-swap on the job's
/// status column.
///
/// ## Implementation Requirements
///
/// Implementations must:
/// - persist `create` atomically, and `create_batch` all-or-nothing
/// - make `transition` a truly atomic conditional update; running more than
///   one dispatcher against a store without this guarantee risks executing a
///   job twice
/// - return due jobs ordered by `priority` descending, then `scheduled_for`
///   ascending
pub trait JobStore: Send + Sync {
    /// Persist a new `pending` job.
    fn create(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Persist several jobs in one transaction (all or nothing).
    fn create_batch(&self, jobs: Vec<Job>) -> Result<Vec<JobId>, JobStoreError>;

    /// Up to `limit` jobs that are due at `now`.
    ///
    /// Due means `pending`, `scheduled_for <= now` and no `next_retry_at` in
    /// the future. This is a plain read; claiming happens per job through
    /// `transition`.
    fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Apply `transition` only if the job's current status is `expected`.
    ///
    /// Returns the updated job, or `None` when the job is missing or its
    /// status no longer matches (another caller got there first). Returns
    /// `InvalidTransition` if the lifecycle has no such edge from `expected`.
    fn transition(
        &self,
        job_id: JobId,
        expected: JobStatus,
        transition: &Transition,
    ) -> Result<Option<Job>, JobStoreError>;

    fn find_by_id(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Jobs in `status`, oldest first.
    fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Delete terminal jobs (`completed`, `failed`, `cancelled`) that finished
    /// before `cutoff`. Returns the ids of deleted jobs.
    fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>, JobStoreError>;

    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn create(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).create(job)
    }

    fn create_batch(&self, jobs: Vec<Job>) -> Result<Vec<JobId>, JobStoreError> {
        (**self).create_batch(jobs)
    }

    fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).claim_due(now, limit)
    }

    fn transition(
        &self,
        job_id: JobId,
        expected: JobStatus,
        transition: &Transition,
    ) -> Result<Option<Job>, JobStoreError> {
        (**self).transition(job_id, expected, transition)
    }

    fn find_by_id(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).find_by_id(job_id)
    }

    fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_status(status, limit)
    }

    fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>, JobStoreError> {
        (**self).delete_finished_before(cutoff)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}
