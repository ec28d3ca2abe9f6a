//! Progress reporting for a running attempt.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, warn};

use jobforge_core::{JobId, JobStatus, NewLogEntry, Transition};

use super::journal::JobJournal;
use crate::store::JobStore;

/// Wall-clock anchored at an injected start time.
///
/// Timestamps are `start + elapsed monotonic time`, so callers that
/// inject a fixed `now` get deterministic claim times while outcome and
/// progress times still move forward.
#[derive(Debug, Clone, Copy)]
pub struct AttemptClock {
    base: DateTime<Utc>,
    started: Instant,
}

impl AttemptClock {
    pub fn start(base: DateTime<Utc>) -> Self {
        Self {
            base,
            started: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.base + chrono::Duration::from_std(self.started.elapsed()).unwrap_or_default()
    }
}

/// Progress channel handed to a handler for one attempt.
///
/// Values are clamped to `0..=100` and never move backwards within the
/// attempt: a lower value than the last one reported is raised to it. Each
/// update is written to the store right away and only applies while the job
/// is still `processing`. Store errors are logged, not returned.
pub struct ProgressReporter<'a> {
    job_id: JobId,
    store: &'a dyn JobStore,
    journal: JobJournal<'a>,
    clock: AttemptClock,
    current: AtomicU8,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(
        job_id: JobId,
        store: &'a dyn JobStore,
        journal: JobJournal<'a>,
        clock: AttemptClock,
    ) -> Self {
        Self {
            job_id,
            store,
            journal,
            clock,
            current: AtomicU8::new(0),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Current time on the attempt's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Highest percentage reported in this attempt so far.
    pub fn current(&self) -> u8 {
        self.current.load(Ordering::SeqCst)
    }

    /// Report progress. Returns whether the update was persisted.
    ///
    /// A message, when given, is also appended to the job's log.
    pub fn update(&self, percent: i64, message: Option<&str>) -> bool {
        let requested = percent.clamp(0, 100) as u8;
        let previous = self.current.fetch_max(requested, Ordering::SeqCst);
        let percent = previous.max(requested);
        let at = self.clock.now();

        let transition = Transition::Progress {
            percent,
            message: message.map(str::to_owned),
            at,
        };

        match self
            .store
            .transition(self.job_id, JobStatus::Processing, &transition)
        {
            Ok(Some(_)) => {
                if let Some(message) = message {
                    self.journal.record(
                        NewLogEntry::info(self.job_id, message)
                            .with_metadata(json!({ "progress": percent }))
                            .at(at),
                    );
                }
                true
            }
            Ok(None) => {
                debug!(job_id = %self.job_id, percent, "progress ignored; job is no longer processing");
                false
            }
            Err(err) => {
                warn!(job_id = %self.job_id, error = %err, "failed to persist job progress");
                false
            }
        }
    }
}
