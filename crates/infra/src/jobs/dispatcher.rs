//! Dispatcher: drives due jobs through the lifecycle.
//!
//! For each due job, in order:
//!
//! 1. resolve the handler; with none registered the job goes straight to
//!    `failed` (`pending -> failed`, no attempt is counted)
//! 2. claim it (`pending -> processing` compare-and-swap); a miss means
//!    another dispatcher or a cancel got there first, and the job is skipped
//! 3. run the handler with the payload and a progress reporter
//! 4. record the outcome: `completed`, `pending` with a backoff, or `failed`
//!
//! Outcomes are written with the expected status `processing`, so a job that
//! was cancelled while its handler ran stays cancelled and the outcome is
//! dropped.
//!
//! Delivery is at-least-once. There is no lease: a dispatcher that dies
//! mid-attempt leaves its job in `processing` until an operator intervenes.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use jobforge_core::{
    Job, JobFailure, JobStatus, NewLogEntry, RetryDecision, RetryPolicy, Transition,
};

use super::journal::JobJournal;
use super::panic_trace;
use super::progress::{AttemptClock, ProgressReporter};
use super::registry::HandlerRegistry;
use crate::log_store::JobLogStore;
use crate::store::{JobStore, JobStoreError};

/// What happened to a single due job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed,
    RetryScheduled,
    Failed,
    /// No handler registered for the job type.
    Rejected,
    /// The claim lost a race; nothing was done.
    Skipped,
    /// The handler finished but the job had left `processing` (cancelled).
    Discarded,
}

impl DispatchOutcome {
    /// Whether this call moved the job out of `pending`.
    pub fn was_processed(&self) -> bool {
        !matches!(self, DispatchOutcome::Skipped)
    }
}

pub struct Dispatcher<S, L> {
    store: S,
    logs: L,
    registry: HandlerRegistry,
    retry: RetryPolicy,
    max_concurrent: usize,
}

impl<S, L> Dispatcher<S, L>
where
    S: JobStore,
    L: JobLogStore,
{
    pub fn new(store: S, logs: L, registry: HandlerRegistry) -> Self {
        Self {
            store,
            logs,
            registry,
            retry: RetryPolicy::default(),
            max_concurrent: 1,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run up to `max` distinct jobs of a batch at the same time (minimum 1).
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn logs(&self) -> &L {
        &self.logs
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub(crate) fn journal(&self) -> JobJournal<'_> {
        JobJournal::new(&self.logs)
    }

    /// Process up to `limit` due jobs now.
    pub fn process_jobs(&self, limit: usize) -> Result<usize, JobStoreError> {
        self.process_jobs_at(Utc::now(), limit)
    }

    /// Process up to `limit` jobs that are due at `now`.
    ///
    /// Returns how many jobs left `pending` because of this call (claimed or
    /// rejected). Handler failures are recorded on the job and never returned;
    /// store errors abort the batch and are.
    #[instrument(skip(self), fields(max_concurrent = self.max_concurrent))]
    pub fn process_jobs_at(&self, now: DateTime<Utc>, limit: usize) -> Result<usize, JobStoreError> {
        if limit == 0 {
            return Ok(0);
        }

        let due = self.store.claim_due(now, limit)?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!(due = due.len(), "dispatching due jobs");

        // Each job starts at `now` plus the time spent on earlier jobs.
        let batch = AttemptClock::start(now);
        let workers = self.max_concurrent.min(due.len());
        let processed = if workers <= 1 {
            let mut processed = 0;
            for job in due {
                if self.run_job(job, batch.now())?.was_processed() {
                    processed += 1;
                }
            }
            processed
        } else {
            self.run_concurrently(due, batch, workers)?
        };

        info!(processed, "job batch finished");
        Ok(processed)
    }

    /// Fan a batch out over `workers` scoped threads.
    ///
    /// Jobs are started in batch order; after the first store error no new
    /// job is started and that error is returned.
    fn run_concurrently(
        &self,
        due: Vec<Job>,
        batch: AttemptClock,
        workers: usize,
    ) -> Result<usize, JobStoreError> {
        let next = AtomicUsize::new(0);
        let processed = AtomicUsize::new(0);
        let aborted = AtomicBool::new(false);
        let first_error: Mutex<Option<JobStoreError>> = Mutex::new(None);

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    while !aborted.load(Ordering::SeqCst) {
                        let idx = next.fetch_add(1, Ordering::SeqCst);
                        let Some(job) = due.get(idx) else {
                            break;
                        };

                        match self.run_job(job.clone(), batch.now()) {
                            Ok(outcome) => {
                                if outcome.was_processed() {
                                    processed.fetch_add(1, Ordering::SeqCst);
                                }
                            }
                            Err(err) => {
                                aborted.store(true, Ordering::SeqCst);
                                if let Ok(mut slot) = first_error.lock() {
                                    slot.get_or_insert(err);
                                }
                            }
                        }
                    }
                });
            }
        });

        let error = first_error
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match error {
            Some(err) => Err(err),
            None => Ok(processed.into_inner()),
        }
    }

    /// Drive one due job through a single attempt starting at `now`.
    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type))]
    pub fn run_job(&self, job: Job, now: DateTime<Utc>) -> Result<DispatchOutcome, JobStoreError> {
        let journal = self.journal();

        let Some(handler) = self.registry.resolve(&job.job_type) else {
            let message = format!("no handler registered for job type '{}'", job.job_type);
            let reject = Transition::Reject {
                message: message.clone(),
                at: now,
            };
            return match self.store.transition(job.id, JobStatus::Pending, &reject)? {
                Some(_) => {
                    journal.record(NewLogEntry::error(job.id, message).at(now));
                    Ok(DispatchOutcome::Rejected)
                }
                None => Ok(DispatchOutcome::Skipped),
            };
        };

        let clock = AttemptClock::start(now);
        let Some(claimed) =
            self.store
                .transition(job.id, JobStatus::Pending, &Transition::Claim { at: now })?
        else {
            debug!("job already claimed elsewhere; skipping");
            return Ok(DispatchOutcome::Skipped);
        };

        journal.record(
            NewLogEntry::info(
                claimed.id,
                format!(
                    "starting attempt {}/{}",
                    claimed.attempts, claimed.max_attempts
                ),
            )
            .with_metadata(json!({ "attempt": claimed.attempts }))
            .at(now),
        );

        let outcome = {
            let reporter = ProgressReporter::new(claimed.id, &self.store, journal, clock);
            panic_trace::install();
            let _ = panic_trace::take();
            catch_unwind(AssertUnwindSafe(|| {
                handler.handle(&claimed.payload, &reporter)
            }))
            .unwrap_or_else(|panic| {
                let failure = JobFailure::from_panic(panic.as_ref());
                Err(match panic_trace::take() {
                    Some(trace) => failure.with_stack_trace(trace),
                    None => failure,
                })
            })
        };
        let finished_at = clock.now();

        match outcome {
            Ok(result) => {
                let complete = Transition::Complete {
                    result,
                    at: finished_at,
                };
                if self
                    .store
                    .transition(claimed.id, JobStatus::Processing, &complete)?
                    .is_none()
                {
                    return Ok(self.discard(&claimed, finished_at));
                }
                journal.record(NewLogEntry::info(claimed.id, "job completed").at(finished_at));
                Ok(DispatchOutcome::Completed)
            }
            Err(failure) => self.record_failure(&claimed, failure, finished_at),
        }
    }

    fn record_failure(
        &self,
        claimed: &Job,
        failure: JobFailure,
        failed_at: DateTime<Utc>,
    ) -> Result<DispatchOutcome, JobStoreError> {
        let journal = self.journal();
        let message = failure.message.clone();

        let (transition, outcome) =
            match self
                .retry
                .decide(claimed.attempts, claimed.max_attempts, failed_at)
            {
                RetryDecision::RetryAt(retry_at) => (
                    Transition::ScheduleRetry {
                        failure,
                        retry_at,
                        at: failed_at,
                    },
                    DispatchOutcome::RetryScheduled,
                ),
                RetryDecision::GiveUp => (
                    Transition::Fail {
                        failure,
                        at: failed_at,
                    },
                    DispatchOutcome::Failed,
                ),
            };

        let Some(updated) =
            self.store
                .transition(claimed.id, JobStatus::Processing, &transition)?
        else {
            return Ok(self.discard(claimed, failed_at));
        };

        let entry = match outcome {
            DispatchOutcome::RetryScheduled => NewLogEntry::warn(
                claimed.id,
                format!("attempt {} failed: {message}", claimed.attempts),
            )
            .with_metadata(json!({
                "attempt": claimed.attempts,
                "next_retry_at": updated.next_retry_at,
            })),
            _ => NewLogEntry::error(
                claimed.id,
                format!(
                    "job failed after {} attempt(s): {message}",
                    claimed.attempts
                ),
            )
            .with_metadata(json!({ "attempt": claimed.attempts })),
        };
        journal.record(entry.at(failed_at));

        Ok(outcome)
    }

    fn discard(&self, claimed: &Job, at: DateTime<Utc>) -> DispatchOutcome {
        warn!(job_id = %claimed.id, "job left processing while running; outcome discarded");
        self.journal().record(
            NewLogEntry::warn(claimed.id, "outcome discarded; job is no longer processing").at(at),
        );
        DispatchOutcome::Discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration as StdDuration;

    use chrono::Duration;
    use jobforge_core::{JobPayload, NewJob};
    use serde_json::Value as JsonValue;

    use crate::log_store::InMemoryJobLogStore;
    use crate::store::InMemoryJobStore;

    type TestDispatcher = Dispatcher<Arc<InMemoryJobStore>, Arc<InMemoryJobLogStore>>;

    fn dispatcher(registry: HandlerRegistry) -> TestDispatcher {
        Dispatcher::new(InMemoryJobStore::arc(), InMemoryJobLogStore::arc(), registry)
    }

    fn enqueue(d: &TestDispatcher, new_job: NewJob, now: DateTime<Utc>) -> Job {
        let job = Job::from_new(new_job, now, 3).unwrap();
        d.store().create(job.clone()).unwrap();
        job
    }

    fn ok(_: &JobPayload, _: &ProgressReporter<'_>) -> Result<JsonValue, JobFailure> {
        Ok(json!({"ok": true}))
    }

    #[test]
    fn successful_job_completes() {
        let mut registry = HandlerRegistry::new();
        registry.register("send_email", ok).unwrap();
        let d = dispatcher(registry);
        let now = Utc::now();
        let job = enqueue(&d, NewJob::new("send_email", "Mail", json!({})), now);

        assert_eq!(d.process_jobs_at(now, 10).unwrap(), 1);

        let stored = d.store().find_by_id(job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.progress, 100);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.result, Some(json!({"ok": true})));
        assert!(stored.completed_at.unwrap() >= now);
    }

    #[test]
    fn failure_schedules_backoff() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("flaky", |_: &JobPayload, _: &ProgressReporter<'_>| {
                Err(JobFailure::new("timeout"))
            })
            .unwrap();
        let d = dispatcher(registry);
        let now = Utc::now();
        let job = enqueue(&d, NewJob::new("flaky", "Flaky", json!({})), now);

        d.process_jobs_at(now, 10).unwrap();

        let stored = d.store().find_by_id(job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.error_message.as_deref(), Some("timeout"));
        let retry_at = stored.next_retry_at.unwrap();
        assert!(retry_at >= now + Duration::minutes(2));
        assert!(retry_at < now + Duration::minutes(3));

        // Not due again until the backoff elapses.
        assert_eq!(d.process_jobs_at(now + Duration::minutes(1), 10).unwrap(), 0);
    }

    #[test]
    fn panics_are_failures() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("explodes", |_: &JobPayload, _: &ProgressReporter<'_>| -> Result<JsonValue, JobFailure> {
                panic!("index out of bounds")
            })
            .unwrap();
        let d = dispatcher(registry);
        let now = Utc::now();
        let job = enqueue(
            &d,
            NewJob::new("explodes", "Boom", json!({})).max_attempts(1),
            now,
        );

        assert_eq!(d.run_job(job.clone(), now).unwrap(), DispatchOutcome::Failed);

        let stored = d.store().find_by_id(job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(
            stored.error_message.as_deref(),
            Some("handler panicked: index out of bounds")
        );
        assert!(stored.stack_trace.unwrap().contains("panics_are_failures"));
    }

    #[test]
    fn unregistered_type_is_rejected_without_an_attempt() {
        let d = dispatcher(HandlerRegistry::new());
        let now = Utc::now();
        let job = enqueue(&d, NewJob::new("mystery", "?", json!({})), now);

        assert_eq!(d.run_job(job.clone(), now).unwrap(), DispatchOutcome::Rejected);

        let stored = d.store().find_by_id(job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 0);
        assert!(stored.error_message.unwrap().contains("mystery"));
    }

    #[test]
    fn lost_claim_is_skipped() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut registry = HandlerRegistry::new();
        registry
            .register("count", move |_: &JobPayload, _: &ProgressReporter<'_>| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!(null))
            })
            .unwrap();
        let d = dispatcher(registry);
        let now = Utc::now();
        let job = enqueue(&d, NewJob::new("count", "c", json!({})), now);

        d.store()
            .transition(job.id, JobStatus::Pending, &Transition::Claim { at: now })
            .unwrap();

        assert_eq!(d.run_job(job, now).unwrap(), DispatchOutcome::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancellation_during_run_discards_outcome() {
        let store = InMemoryJobStore::arc();
        let handle = store.clone();
        let mut registry = HandlerRegistry::new();
        registry
            .register("long", move |_: &JobPayload, progress: &ProgressReporter<'_>| {
                handle
                    .transition(
                        progress.job_id(),
                        JobStatus::Processing,
                        &Transition::Cancel { at: progress.now() },
                    )
                    .map_err(|e| JobFailure::new(e.to_string()))?;
                Ok(json!("done"))
            })
            .unwrap();
        let d = Dispatcher::new(store, InMemoryJobLogStore::arc(), registry);
        let now = Utc::now();
        let job = enqueue(&d, NewJob::new("long", "l", json!({})), now);

        assert_eq!(d.run_job(job.clone(), now).unwrap(), DispatchOutcome::Discarded);

        let stored = d.store().find_by_id(job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert!(stored.result.is_none());
    }

    #[test]
    fn batch_runs_in_priority_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut registry = HandlerRegistry::new();
        registry
            .register("ordered", move |payload: &JobPayload, _: &ProgressReporter<'_>| {
                if let Ok(mut seen) = sink.lock() {
                    seen.push(payload.as_value()["n"].clone());
                }
                Ok(json!(null))
            })
            .unwrap();
        let d = dispatcher(registry);
        let now = Utc::now();
        enqueue(&d, NewJob::new("ordered", "low", json!({"n": 1})).priority(1), now);
        enqueue(&d, NewJob::new("ordered", "high", json!({"n": 9})).priority(9), now);
        enqueue(&d, NewJob::new("ordered", "mid", json!({"n": 5})).priority(5), now);

        assert_eq!(d.process_jobs_at(now, 2).unwrap(), 2);
        assert_eq!(*seen.lock().unwrap(), vec![json!(9), json!(5)]);
    }

    #[test]
    fn concurrent_batches_process_every_job_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let mut registry = HandlerRegistry::new();
        registry
            .register("slow", move |_: &JobPayload, _: &ProgressReporter<'_>| {
                thread::sleep(StdDuration::from_millis(5));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!(null))
            })
            .unwrap();
        let d = dispatcher(registry).with_max_concurrent(4);
        let now = Utc::now();
        for i in 0..12 {
            enqueue(&d, NewJob::new("slow", format!("job {i}"), json!({})), now);
        }

        assert_eq!(d.process_jobs_at(now, 20).unwrap(), 12);
        assert_eq!(calls.load(Ordering::SeqCst), 12);
        assert_eq!(d.store().stats().unwrap().completed, 12);
    }

    #[test]
    fn zero_limit_is_a_no_op() {
        let d = dispatcher(HandlerRegistry::new());
        let now = Utc::now();
        enqueue(&d, NewJob::new("mystery", "?", json!({})), now);
        assert_eq!(d.process_jobs_at(now, 0).unwrap(), 0);
        assert_eq!(d.store().stats().unwrap().pending, 1);
    }

    #[test]
    fn later_jobs_in_a_batch_are_stamped_with_their_own_start() {
        let failed_at: Arc<Mutex<Option<DateTime<Utc>>>> = Arc::default();
        let seen = failed_at.clone();
        let mut registry = HandlerRegistry::new();
        registry
            .register("slow", |_: &JobPayload, _: &ProgressReporter<'_>| {
                thread::sleep(StdDuration::from_millis(300));
                Ok(json!(null))
            })
            .unwrap();
        registry
            .register("flaky", move |_: &JobPayload, _: &ProgressReporter<'_>| {
                *seen.lock().unwrap() = Some(Utc::now());
                Err(JobFailure::new("timeout"))
            })
            .unwrap();
        let d = dispatcher(registry).with_retry_policy(RetryPolicy::with_base(StdDuration::from_millis(50)));
        let now = Utc::now();
        enqueue(&d, NewJob::new("slow", "Slow", json!({})).priority(10), now);
        let flaky = enqueue(&d, NewJob::new("flaky", "Flaky", json!({})).priority(1), now);

        assert_eq!(d.process_jobs(10).unwrap(), 2);

        let failed_at = failed_at.lock().unwrap().unwrap();
        let stored = d.store().find_by_id(flaky.id).unwrap().unwrap();
        assert!(stored.last_attempt_at.unwrap() >= now + Duration::milliseconds(300));
        assert!(stored.next_retry_at.unwrap() > failed_at);
    }

    #[test]
    fn stored_progress_restarts_with_each_attempt() {
        let store = InMemoryJobStore::arc();
        let observed: Arc<Mutex<Vec<u8>>> = Arc::default();
        let (reader, seen) = (store.clone(), observed.clone());
        let mut registry = HandlerRegistry::new();
        registry
            .register("import", move |_: &JobPayload, progress: &ProgressReporter<'_>| {
                let stored = reader.find_by_id(progress.job_id()).unwrap().unwrap();
                seen.lock().unwrap().push(stored.progress);
                progress.update(10, None);
                let after = reader.find_by_id(progress.job_id()).unwrap().unwrap();
                seen.lock().unwrap().push(after.progress);
                progress.update(80, Some("almost"));
                Err(JobFailure::new("disk full"))
            })
            .unwrap();
        let d = Dispatcher::new(store.clone(), InMemoryJobLogStore::arc(), registry);
        let now = Utc::now();
        let job = enqueue(&d, NewJob::new("import", "Import", json!({})), now);

        d.process_jobs_at(now, 10).unwrap();
        let retry_at = store.find_by_id(job.id).unwrap().unwrap().next_retry_at.unwrap();
        d.process_jobs_at(retry_at, 10).unwrap();

        assert_eq!(*observed.lock().unwrap(), vec![0, 10, 0, 10]);
        let stored = store.find_by_id(job.id).unwrap().unwrap();
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.progress, 80);
    }
}
