//! Infrastructure layer: job storage, configuration and the job runtime.

pub mod config;
pub mod jobs;
pub mod log_store;
pub mod store;


pub use config::{ConfigError, JobsConfig, JobsConfigLayer};
pub use jobs::{HandlerRegistry, JobService, JobServiceError, JobWorker, WorkerConfig};
pub use log_store::{InMemoryJobLogStore, JobLogStore, PostgresJobLogStore};
pub use store::{InMemoryJobStore, JobStore, PostgresJobStore};
