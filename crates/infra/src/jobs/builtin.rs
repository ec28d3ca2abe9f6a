//! Handlers shipped with the engine.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;

use jobforge_core::{JobFailure, JobPayload};

use super::progress::ProgressReporter;
use super::registry::{HandlerRegistry, RegistryError};
use super::retention::{cutoff_for, purge_finished_jobs};
use crate::log_store::JobLogStore;
use crate::store::JobStore;

/// Job type of the retention sweep.
pub const CLEANUP_JOB_TYPE: &str = "jobforge.cleanup";

#[derive(Debug, Deserialize)]
struct CleanupPayload {
    days_old: Option<u32>,
}

/// Register every built-in handler.
///
/// `default_days_old` applies to cleanup jobs whose payload has no
/// `days_old`.
pub fn register_builtin_handlers(
    registry: &mut HandlerRegistry,
    store: Arc<dyn JobStore>,
    logs: Arc<dyn JobLogStore>,
    default_days_old: u32,
) -> Result<(), RegistryError> {
    registry.register(
        CLEANUP_JOB_TYPE,
        move |payload: &JobPayload, progress: &ProgressReporter<'_>| {
            let params: CleanupPayload = payload.decode()?;
            let days_old = params.days_old.unwrap_or(default_days_old);
            let cutoff = cutoff_for(progress.now(), days_old);

            progress.update(10, Some(&format!("purging jobs finished before {cutoff}")));
            let deleted = purge_finished_jobs(store.as_ref(), logs.as_ref(), cutoff)
                .map_err(|e| JobFailure::new(format!("retention sweep failed: {e}")))?;
            progress.update(100, Some(&format!("purged {deleted} job(s)")));

            Ok(json!({ "deleted": deleted, "cutoff": cutoff, "days_old": days_old }))
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use jobforge_core::{Job, JobStatus, NewJob, Transition};

    use crate::jobs::service::JobService;
    use crate::log_store::InMemoryJobLogStore;
    use crate::store::InMemoryJobStore;

    #[test]
    fn cleanup_job_purges_old_finished_jobs() {
        let store = InMemoryJobStore::arc();
        let logs = InMemoryJobLogStore::arc();
        let mut registry = HandlerRegistry::new();
        register_builtin_handlers(&mut registry, store.clone(), logs.clone(), 30).unwrap();
        let svc = JobService::new(store.clone(), logs, registry);

        let old = Utc::now() - Duration::days(60);
        let stale = Job::from_new(NewJob::new("report", "stale", json!({})), old, 3).unwrap();
        let stale_id = store.create(stale).unwrap();
        store
            .transition(stale_id, JobStatus::Pending, &Transition::Cancel { at: old })
            .unwrap();

        let sweep = svc
            .create_job(NewJob::new(CLEANUP_JOB_TYPE, "nightly cleanup", json!({ "days_old": 7 })))
            .unwrap();
        assert_eq!(svc.process_jobs(10).unwrap(), 1);

        let job = svc.get_job(sweep).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.unwrap()["deleted"], 1);
        assert!(svc.get_job(stale_id).unwrap().is_none());

        let messages: Vec<_> = svc
            .get_job_logs(sweep, 10)
            .unwrap()
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert!(messages.iter().any(|m| m == "purged 1 job(s)"));
    }

    #[test]
    fn malformed_payload_fails_the_attempt() {
        let store = InMemoryJobStore::arc();
        let logs = InMemoryJobLogStore::arc();
        let mut registry = HandlerRegistry::new();
        register_builtin_handlers(&mut registry, store.clone(), logs.clone(), 30).unwrap();
        let svc = JobService::new(store, logs, registry);

        let id = svc
            .create_job(
                NewJob::new(CLEANUP_JOB_TYPE, "bad", json!({ "days_old": "soon" })).max_attempts(1),
            )
            .unwrap();
        svc.process_jobs(10).unwrap();

        let status = svc.get_job_status(id).unwrap().unwrap();
        assert_eq!(status.status, JobStatus::Failed);
        assert!(status.error.unwrap().starts_with("invalid payload"));
    }
}
