//! Failure descriptions recorded on jobs.

use std::any::Any;

use serde::{Deserialize, Serialize};

/// Why a handler invocation failed.
///
/// `message` ends up in the job's `error_message`, `stack_trace` in its
/// `stack_trace` column. Explicit failures and panics are represented the
/// same way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct JobFailure {
    pub message: String,
    pub stack_trace: Option<String>,
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack_trace: None,
        }
    }

    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }

    /// Build a failure from a caught panic payload.
    ///
    /// The payload carries no backtrace; callers that captured one at the
    /// panic site attach it with [`JobFailure::with_stack_trace`].
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let detail = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };

        Self {
            message: format!("handler panicked: {detail}"),
            stack_trace: None,
        }
    }
}

impl From<anyhow::Error> for JobFailure {
    fn from(err: anyhow::Error) -> Self {
        // `{:?}` on anyhow renders the cause chain (and backtrace when enabled).
        Self {
            message: err.to_string(),
            stack_trace: Some(format!("{err:?}")),
        }
    }
}

impl From<serde_json::Error> for JobFailure {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("invalid payload: {err}"))
    }
}

impl From<String> for JobFailure {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for JobFailure {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}
