//! Append-only per-job log trail.
//!
//! Log writes are best-effort from the engine's point of view: callers in
//! the dispatcher swallow [`JobLogStoreError`] after reporting it through
//! `tracing`. The store itself still reports failures honestly.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use thiserror::Error;

use jobforge_core::{JobId, JobLogEntry, NewLogEntry};

pub use in_memory::InMemoryJobLogStore;
pub use postgres::PostgresJobLogStore;

#[derive(Debug, Error)]
pub enum JobLogStoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Storage for job log entries.
pub trait JobLogStore: Send + Sync {
    /// Append an entry; the store assigns the id.
    fn append(&self, entry: NewLogEntry) -> Result<JobLogEntry, JobLogStoreError>;

    /// Up to `limit` entries for `job_id`, most recent first.
    ///
    /// Entries with equal `created_at` are ordered by id, newest first.
    fn recent(&self, job_id: JobId, limit: usize) -> Result<Vec<JobLogEntry>, JobLogStoreError>;

    /// Drop every entry of the given jobs. Returns the number removed.
    fn delete_for_jobs(&self, job_ids: &[JobId]) -> Result<u64, JobLogStoreError>;
}

impl<S> JobLogStore for Arc<S>
where
    S: JobLogStore + ?Sized,
{
    fn append(&self, entry: NewLogEntry) -> Result<JobLogEntry, JobLogStoreError> {
        (**self).append(entry)
    }

    fn recent(&self, job_id: JobId, limit: usize) -> Result<Vec<JobLogEntry>, JobLogStoreError> {
        (**self).recent(job_id, limit)
    }

    fn delete_for_jobs(&self, job_ids: &[JobId]) -> Result<u64, JobLogStoreError> {
        (**self).delete_for_jobs(job_ids)
    }
}
