//! Retention sweep for finished jobs.

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::log_store::JobLogStore;
use crate::store::{JobStore, JobStoreError};

/// Oldest `completed_at` that survives a sweep with `days_old`.
pub fn cutoff_for(now: DateTime<Utc>, days_old: u32) -> DateTime<Utc> {
    now - Duration::days(i64::from(days_old))
}

/// Delete terminal jobs finished before `cutoff`, along with their logs.
///
/// Returns the number of jobs deleted. Failing to delete the log trail is
/// logged and does not fail the sweep.
pub fn purge_finished_jobs(
    store: &dyn JobStore,
    logs: &dyn JobLogStore,
    cutoff: DateTime<Utc>,
) -> Result<usize, JobStoreError> {
    let deleted = store.delete_finished_before(cutoff)?;

    if !deleted.is_empty() {
        if let Err(err) = logs.delete_for_jobs(&deleted) {
            warn!(error = %err, jobs = deleted.len(), "failed to delete logs of purged jobs");
        }
    }

    info!(deleted = deleted.len(), %cutoff, "purged finished jobs");
    Ok(deleted.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_core::{Job, JobStatus, NewJob, NewLogEntry, Transition};

    use crate::log_store::InMemoryJobLogStore;
    use crate::store::InMemoryJobStore;

    #[test]
    fn cutoff_counts_whole_days() {
        let now = Utc::now();
        assert_eq!(cutoff_for(now, 30), now - Duration::days(30));
        assert_eq!(cutoff_for(now, 0), now);
    }

    #[test]
    fn purge_removes_jobs_and_their_logs() {
        let store = InMemoryJobStore::new();
        let logs = InMemoryJobLogStore::new();
        let now = Utc::now();
        let old = now - Duration::days(45);

        let job = Job::from_new(NewJob::new("t", "old", serde_json::json!({})), old, 3).unwrap();
        let id = store.create(job).unwrap();
        store
            .transition(id, JobStatus::Pending, &Transition::Cancel { at: old })
            .unwrap();
        logs.append(NewLogEntry::info(id, "job cancelled").at(old)).unwrap();

        assert_eq!(purge_finished_jobs(&store, &logs, cutoff_for(now, 30)).unwrap(), 1);
        assert!(store.find_by_id(id).unwrap().is_none());
        assert!(logs.is_empty());

        assert_eq!(purge_finished_jobs(&store, &logs, cutoff_for(now, 30)).unwrap(), 0);
    }
}
