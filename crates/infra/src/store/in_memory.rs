use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use jobforge_core::{Job, JobId, JobStatus, Transition};

use super::r#trait::{JobStats, JobStore, JobStoreError};

/// In-memory job store for tests/dev.
///
/// A single `RwLock` serializes writers, which makes `transition` a real
/// compare-and-swap across threads.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn poisoned() -> JobStoreError {
        JobStoreError::Storage("lock poisoned".to_string())
    }
}

impl JobStore for InMemoryJobStore {
    fn create(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| Self::poisoned())?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn create_batch(&self, batch: Vec<Job>) -> Result<Vec<JobId>, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| Self::poisoned())?;

        // Validate the whole batch before inserting anything.
        for (idx, job) in batch.iter().enumerate() {
            if jobs.contains_key(&job.id) || batch[..idx].iter().any(|j| j.id == job.id) {
                return Err(JobStoreError::AlreadyExists(job.id));
            }
        }

        let ids = batch.iter().map(|j| j.id).collect();
        for job in batch {
            jobs.insert(job.id, job);
        }
        Ok(ids)
    }

    fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| Self::poisoned())?;

        let mut due: Vec<_> = jobs.values().filter(|j| j.is_due(now)).collect();
        due.sort_by_key(|j| (Reverse(j.priority), j.scheduled_for, j.created_at, j.id));

        Ok(due.into_iter().take(limit).cloned().collect())
    }

    fn transition(
        &self,
        job_id: JobId,
        expected: JobStatus,
        transition: &Transition,
    ) -> Result<Option<Job>, JobStoreError> {
        transition.check_from(expected)?;

        let mut jobs = self.jobs.write().map_err(|_| Self::poisoned())?;
        match jobs.get_mut(&job_id) {
            Some(job) if job.status == expected => {
                transition.apply(job)?;
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    fn find_by_id(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| Self::poisoned())?;
        Ok(jobs.get(&job_id).cloned())
    }

    fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| Self::poisoned())?;
        let mut result: Vec<_> = jobs.values().filter(|j| j.status == status).cloned().collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| Self::poisoned())?;

        let expired: Vec<JobId> = jobs
            .values()
            .filter(|j| j.status.is_terminal() && j.completed_at.is_some_and(|at| at < cutoff))
            .map(|j| j.id)
            .collect();

        for id in &expired {
            jobs.remove(id);
        }
        Ok(expired)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| Self::poisoned())?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }
}
