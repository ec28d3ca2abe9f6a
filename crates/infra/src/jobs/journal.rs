//! Best-effort writer for the per-job log trail.

use tracing::{debug, error, info, warn};

use jobforge_core::{LogLevel, NewLogEntry};

use crate::log_store::JobLogStore;

/// Appends job log entries and mirrors each one as a `tracing` event.
///
/// A failed append is reported with `warn!` and otherwise ignored: losing a
/// log line must never fail or roll back the job operation that produced it.
#[derive(Clone, Copy)]
pub struct JobJournal<'a> {
    logs: &'a dyn JobLogStore,
}

impl<'a> JobJournal<'a> {
    pub fn new(logs: &'a dyn JobLogStore) -> Self {
        Self { logs }
    }

    pub fn record(&self, entry: NewLogEntry) {
        let job_id = entry.job_id;
        match entry.level {
            LogLevel::Debug => debug!(job_id = %job_id, "{}", entry.message),
            LogLevel::Info => info!(job_id = %job_id, "{}", entry.message),
            LogLevel::Warn => warn!(job_id = %job_id, "{}", entry.message),
            LogLevel::Error => error!(job_id = %job_id, "{}", entry.message),
        }

        if let Err(err) = self.logs.append(entry) {
            warn!(job_id = %job_id, error = %err, "failed to append job log entry");
        }
    }
}
