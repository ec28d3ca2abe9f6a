//! `jobforge-core`: job engine domain building blocks.
//!
//! This crate contains **pure domain** primitives: the job record, its
//! lifecycle state machine, the retry policy and log entry types. No storage
//! or runtime concerns live here.

pub mod error;
pub mod failure;
pub mod id;
pub mod job;
pub mod log;
pub mod payload;
pub mod retry;
pub mod transition;

pub use error::{DomainError, DomainResult};
pub use failure::JobFailure;
pub use id::{JobId, OwnerId};
pub use job::{DEFAULT_MAX_ATTEMPTS, Job, MAX_ATTEMPTS_LIMIT, JobStatus, JobStatusView, NewJob};
pub use log::{JobLogEntry, LogLevel, NewLogEntry};
pub use payload::JobPayload;
pub use retry::{MAX_BACKOFF, RetryDecision, RetryPolicy};
pub use transition::Transition;
