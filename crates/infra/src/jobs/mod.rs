//! Background job runtime: handler registry, dispatcher, service facade and
//! polling worker.
//!
//! ## Components
//!
//! - `HandlerRegistry`: job type -> handler, built once at startup
//! - `Dispatcher`: claims due jobs and records handler outcomes
//! - `ProgressReporter`: per-attempt progress channel given to handlers
//! - `JobService`: create/cancel/retry/inspect jobs, run batches, clean up
//! - `JobWorker`: background thread polling `JobService::process_jobs`

pub mod builtin;
pub mod dispatcher;
pub mod journal;
mod panic_trace;
pub mod progress;
pub mod registry;
pub mod retention;
pub mod service;
pub mod worker;

pub use builtin::{CLEANUP_JOB_TYPE, register_builtin_handlers};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use journal::JobJournal;
pub use progress::{AttemptClock, ProgressReporter};
pub use registry::{HandlerRegistry, JobHandler, RegistryError};
pub use service::{JobService, JobServiceError, JobServiceResult};
pub use worker::{JobWorker, WorkerConfig, WorkerHandle, WorkerStats};
