//! Job type -> handler mapping.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;

use jobforge_core::{JobFailure, JobPayload};

use super::progress::ProgressReporter;

/// Executes jobs of one type.
///
/// A handler gets the job's payload and a progress reporter bound to the
/// running attempt. `Ok` completes the job with the returned value as its
/// result; `Err` (or a panic) counts as a failed attempt.
pub trait JobHandler: Send + Sync {
    fn handle(
        &self,
        payload: &JobPayload,
        progress: &ProgressReporter<'_>,
    ) -> Result<JsonValue, JobFailure>;
}

impl<F> JobHandler for F
where
    F: Fn(&JobPayload, &ProgressReporter<'_>) -> Result<JsonValue, JobFailure> + Send + Sync,
{
    fn handle(
        &self,
        payload: &JobPayload,
        progress: &ProgressReporter<'_>,
    ) -> Result<JsonValue, JobFailure> {
        self(payload, progress)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a handler for job type '{0}' is already registered")]
    DuplicateHandler(String),

    #[error("job type must not be empty")]
    EmptyJobType,
}

/// Handlers by job type.
///
/// Built once at startup and handed to the dispatcher; it is not mutated
/// while jobs run.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure for `job_type`.
    pub fn register<F>(&mut self, job_type: impl Into<String>, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(&JobPayload, &ProgressReporter<'_>) -> Result<JsonValue, JobFailure>
            + Send
            + Sync
            + 'static,
    {
        self.register_handler(job_type, handler)
    }

    /// Register any [`JobHandler`] implementation for `job_type`.
    pub fn register_handler<H>(
        &mut self,
        job_type: impl Into<String>,
        handler: H,
    ) -> Result<(), RegistryError>
    where
        H: JobHandler + 'static,
    {
        let job_type = job_type.into();
        if job_type.trim().is_empty() {
            return Err(RegistryError::EmptyJobType);
        }
        if self.handlers.contains_key(&job_type) {
            return Err(RegistryError::DuplicateHandler(job_type));
        }
        self.handlers.insert(job_type, Arc::new(handler));
        Ok(())
    }

    /// Exact-match lookup.
    pub fn resolve(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.types())
            .finish()
    }
}
