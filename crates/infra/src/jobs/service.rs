//! Job engine facade used by the rest of the application.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument};

use jobforge_core::{
    DEFAULT_MAX_ATTEMPTS, DomainError, Job, JobId, JobLogEntry, JobStatus, JobStatusView,
    NewJob, NewLogEntry, RetryPolicy, Transition,
};

use super::dispatcher::Dispatcher;
use super::registry::HandlerRegistry;
use super::retention::{cutoff_for, purge_finished_jobs};
use crate::config::JobsConfig;
use crate::log_store::{JobLogStore, JobLogStoreError};
use crate::store::{JobStats, JobStore, JobStoreError};

#[derive(Debug, Error)]
pub enum JobServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    Logs(#[from] JobLogStoreError),
}

pub type JobServiceResult<T> = Result<T, JobServiceError>;

/// Creates, inspects, cancels and runs jobs.
///
/// The handler registry is fixed at construction; register every handler
/// before building the service.
pub struct JobService<S, L> {
    dispatcher: Dispatcher<S, L>,
    default_max_attempts: u32,
}

impl<S, L> JobService<S, L>
where
    S: JobStore,
    L: JobLogStore,
{
    pub fn new(store: S, logs: L, registry: HandlerRegistry) -> Self {
        Self {
            dispatcher: Dispatcher::new(store, logs, registry),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Build a service with the retry base, concurrency and default attempt
    /// budget taken from `config`.
    pub fn from_config(store: S, logs: L, registry: HandlerRegistry, config: &JobsConfig) -> Self {
        Self::new(store, logs, registry)
            .with_retry_policy(config.retry_policy())
            .with_max_concurrent(config.max_concurrent)
            .with_default_max_attempts(config.default_max_attempts)
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.dispatcher = self.dispatcher.with_retry_policy(retry);
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.dispatcher = self.dispatcher.with_max_concurrent(max);
        self
    }

    /// Attempts granted to jobs that do not set `max_attempts` (minimum 1).
    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher<S, L> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &HandlerRegistry {
        self.dispatcher.registry()
    }

    fn store(&self) -> &S {
        self.dispatcher.store()
    }

    #[instrument(skip(self, new_job), fields(job_type = %new_job.job_type), err)]
    pub fn create_job(&self, new_job: NewJob) -> JobServiceResult<JobId> {
        let now = Utc::now();
        let job = Job::from_new(new_job, now, self.default_max_attempts)?;
        let (job_type, priority) = (job.job_type.clone(), job.priority);

        let id = self.store().create(job)?;
        self.dispatcher.journal().record(
            NewLogEntry::info(id, format!("job created ({job_type}, priority {priority})")).at(now),
        );
        Ok(id)
    }

    /// Create several jobs at once; either all are stored or none.
    #[instrument(skip(self, new_jobs), fields(batch_size = new_jobs.len()), err)]
    pub fn create_jobs(&self, new_jobs: Vec<NewJob>) -> JobServiceResult<Vec<JobId>> {
        let now = Utc::now();
        let jobs = new_jobs
            .into_iter()
            .map(|new_job| Job::from_new(new_job, now, self.default_max_attempts))
            .collect::<Result<Vec<_>, _>>()?;

        let ids = self.store().create_batch(jobs)?;
        let journal = self.dispatcher.journal();
        for id in &ids {
            journal.record(NewLogEntry::info(*id, "job created in batch").at(now));
        }
        Ok(ids)
    }

    /// Cancel a `pending` or `processing` job.
    ///
    /// Returns `false` for unknown jobs and jobs that already finished. A
    /// running handler is not interrupted; its outcome is discarded.
    #[instrument(skip(self), err)]
    pub fn cancel_job(&self, job_id: JobId) -> JobServiceResult<bool> {
        loop {
            let Some(job) = self.store().find_by_id(job_id)? else {
                return Ok(false);
            };
            if !matches!(job.status, JobStatus::Pending | JobStatus::Processing) {
                debug!(status = %job.status, "job is not cancellable");
                return Ok(false);
            }

            let now = Utc::now();
            if self
                .store()
                .transition(job_id, job.status, &Transition::Cancel { at: now })?
                .is_some()
            {
                self.dispatcher.journal().record(
                    NewLogEntry::warn(job_id, format!("job cancelled while {}", job.status)).at(now),
                );
                return Ok(true);
            }
            // Status changed between read and write; look again.
        }
    }

    /// Requeue a `failed` job with a fresh attempt budget.
    ///
    /// Returns `false` unless the job exists and is `failed`.
    #[instrument(skip(self), err)]
    pub fn retry_job(&self, job_id: JobId) -> JobServiceResult<bool> {
        let now = Utc::now();
        let requeued = self
            .store()
            .transition(job_id, JobStatus::Failed, &Transition::Requeue { at: now })?;

        if requeued.is_some() {
            self.dispatcher
                .journal()
                .record(NewLogEntry::info(job_id, "job manually requeued").at(now));
        }
        Ok(requeued.is_some())
    }

    pub fn get_job(&self, job_id: JobId) -> JobServiceResult<Option<Job>> {
        Ok(self.store().find_by_id(job_id)?)
    }

    pub fn get_job_status(&self, job_id: JobId) -> JobServiceResult<Option<JobStatusView>> {
        Ok(self.store().find_by_id(job_id)?.map(|job| job.status_view()))
    }

    /// Up to `limit` log entries of the job, most recent first.
    pub fn get_job_logs(&self, job_id: JobId, limit: usize) -> JobServiceResult<Vec<JobLogEntry>> {
        Ok(self.dispatcher.logs().recent(job_id, limit)?)
    }

    /// Jobs in `status`, oldest first.
    pub fn list_jobs(&self, status: JobStatus, limit: usize) -> JobServiceResult<Vec<Job>> {
        Ok(self.store().list_by_status(status, limit)?)
    }

    pub fn stats(&self) -> JobServiceResult<JobStats> {
        Ok(self.store().stats()?)
    }

    /// Run up to `limit` due jobs; see [`Dispatcher::process_jobs_at`].
    pub fn process_jobs(&self, limit: usize) -> JobServiceResult<usize> {
        Ok(self.dispatcher.process_jobs(limit)?)
    }

    pub fn process_jobs_at(&self, now: DateTime<Utc>, limit: usize) -> JobServiceResult<usize> {
        Ok(self.dispatcher.process_jobs_at(now, limit)?)
    }

    /// Delete finished jobs older than `days_old` days. Returns the count.
    pub fn cleanup_old_jobs(&self, days_old: u32) -> JobServiceResult<usize> {
        self.cleanup_old_jobs_at(Utc::now(), days_old)
    }

    #[instrument(skip(self), err)]
    pub fn cleanup_old_jobs_at(&self, now: DateTime<Utc>, days_old: u32) -> JobServiceResult<usize> {
        let cutoff = cutoff_for(now, days_old);
        let deleted = purge_finished_jobs(self.store(), self.dispatcher.logs(), cutoff)?;
        if deleted > 0 {
            info!(deleted, days_old, "old jobs cleaned up");
        }
        Ok(deleted)
    }
}
