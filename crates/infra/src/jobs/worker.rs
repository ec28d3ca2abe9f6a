//! Background polling worker.

use std::io;
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use super::service::JobService;
use crate::config::JobsConfig;
use crate::log_store::JobLogStore;
use crate::store::JobStore;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Thread name, also used in log fields
    pub name: String,
    /// Wait between polls that found less than a full batch
    pub poll_interval: Duration,
    /// Jobs per `process_jobs` call
    pub batch_size: usize,
    /// How often to run the retention sweep; `None` disables it
    pub cleanup_interval: Option<Duration>,
    /// Age in days after which finished jobs are purged
    pub retention_days: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "jobforge-worker".to_string(),
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            cleanup_interval: Some(Duration::from_secs(3600)),
            retention_days: 30,
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_cleanup(mut self, interval: Option<Duration>, retention_days: u32) -> Self {
        self.cleanup_interval = interval;
        self.retention_days = retention_days;
        self
    }
}

impl From<&JobsConfig> for WorkerConfig {
    fn from(config: &JobsConfig) -> Self {
        Self::default()
            .with_poll_interval(config.poll_interval)
            .with_batch_size(config.batch_size)
            .with_cleanup(config.cleanup_interval, config.retention_days)
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub cycles: u64,
    pub jobs_processed: u64,
    pub errors: u64,
    pub jobs_purged: u64,
    pub uptime_secs: u64,
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the current batch to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("job worker thread panicked");
            }
        }
    }

    pub fn stats(&self) -> WorkerStats {
        match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Spawns the polling loop around a [`JobService`].
pub struct JobWorker;

impl JobWorker {
    /// Start polling on a dedicated thread.
    ///
    /// The store backends block on I/O, so the worker runs on its own OS
    /// thread rather than as an async task.
    pub fn spawn<S, L>(service: Arc<JobService<S, L>>, config: WorkerConfig) -> io::Result<WorkerHandle>
    where
        S: JobStore + 'static,
        L: JobLogStore + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || worker_loop(&service, &config, &shutdown_rx, &stats_clone))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn update_stats(stats: &Mutex<WorkerStats>, f: impl FnOnce(&mut WorkerStats)) {
    match stats.lock() {
        Ok(mut s) => f(&mut s),
        Err(poisoned) => f(&mut poisoned.into_inner()),
    }
}

fn worker_loop<S, L>(
    service: &JobService<S, L>,
    config: &WorkerConfig,
    shutdown_rx: &mpsc::Receiver<()>,
    stats: &Mutex<WorkerStats>,
) where
    S: JobStore,
    L: JobLogStore,
{
    info!(worker = %config.name, batch_size = config.batch_size, "job worker started");
    let start_time = Instant::now();
    let mut last_cleanup: Option<Instant> = None;

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        let processed = match service.process_jobs(config.batch_size) {
            Ok(n) => {
                update_stats(stats, |s| s.jobs_processed += n as u64);
                n
            }
            Err(e) => {
                error!(worker = %config.name, error = %e, "failed to process jobs");
                update_stats(stats, |s| s.errors += 1);
                0
            }
        };

        if let Some(interval) = config.cleanup_interval {
            if last_cleanup.is_none_or(|at| at.elapsed() >= interval) {
                last_cleanup = Some(Instant::now());
                match service.cleanup_old_jobs(config.retention_days) {
                    Ok(purged) => update_stats(stats, |s| s.jobs_purged += purged as u64),
                    Err(e) => {
                        error!(worker = %config.name, error = %e, "retention sweep failed");
                        update_stats(stats, |s| s.errors += 1);
                    }
                }
            }
        }

        update_stats(stats, |s| {
            s.cycles += 1;
            s.uptime_secs = start_time.elapsed().as_secs();
        });

        // A full batch suggests more work is waiting.
        if processed >= config.batch_size {
            debug!(worker = %config.name, processed, "full batch; polling again");
            continue;
        }

        match shutdown_rx.recv_timeout(config.poll_interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(worker = %config.name, "job worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_core::{JobFailure, JobPayload, JobStatus, NewJob};
    use serde_json::{Value as JsonValue, json};

    use crate::jobs::progress::ProgressReporter;
    use crate::jobs::registry::HandlerRegistry;
    use crate::log_store::InMemoryJobLogStore;
    use crate::store::InMemoryJobStore;

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn worker_processes_jobs_until_shutdown() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("echo", |payload: &JobPayload, _: &ProgressReporter<'_>| -> Result<JsonValue, JobFailure> {
                Ok(payload.as_value().clone())
            })
            .unwrap();
        let service = Arc::new(JobService::new(
            InMemoryJobStore::arc(),
            InMemoryJobLogStore::arc(),
            registry,
        ));
        for i in 0..5 {
            service
                .create_job(NewJob::new("echo", format!("echo {i}"), json!({ "i": i })))
                .unwrap();
        }

        let handle = JobWorker::spawn(
            service.clone(),
            WorkerConfig::default()
                .with_name("test-worker")
                .with_poll_interval(Duration::from_millis(10))
                .with_batch_size(2),
        )
        .unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            handle.stats().jobs_processed == 5
        }));

        let stats = handle.stats();
        assert_eq!(service.stats().unwrap().completed, 5);
        assert!(stats.cycles >= 2);
        assert_eq!(stats.errors, 0);
        handle.shutdown();

        assert!(service.list_jobs(JobStatus::Pending, 10).unwrap().is_empty());
    }

    #[test]
    fn config_maps_from_jobs_config() {
        let jobs = JobsConfig {
            batch_size: 25,
            cleanup_interval: None,
            retention_days: 7,
            ..JobsConfig::default()
        };
        let worker = WorkerConfig::from(&jobs);
        assert_eq!(worker.batch_size, 25);
        assert_eq!(worker.cleanup_interval, None);
        assert_eq!(worker.retention_days, 7);
        assert_eq!(worker.poll_interval, jobs.poll_interval);
    }
}
