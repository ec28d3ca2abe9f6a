//! Structured per-job log entries.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::DomainError;
use crate::id::JobId;

/// Severity of a job log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl core::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(DomainError::validation(format!("unknown log level: {other}"))),
        }
    }
}

/// A log entry ready to be appended (no id assigned yet).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLogEntry {
    pub job_id: JobId,
    pub level: LogLevel,
    pub message: String,
    pub metadata: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
}

impl NewLogEntry {
    pub fn new(job_id: JobId, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            job_id,
            level,
            message: message.into(),
            metadata: None,
            created_at: Utc::now(),
        }
    }

    pub fn info(job_id: JobId, message: impl Into<String>) -> Self {
        Self::new(job_id, LogLevel::Info, message)
    }

    pub fn warn(job_id: JobId, message: impl Into<String>) -> Self {
        Self::new(job_id, LogLevel::Warn, message)
    }

    pub fn error(job_id: JobId, message: impl Into<String>) -> Self {
        Self::new(job_id, LogLevel::Error, message)
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// A stored, immutable log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLogEntry {
    /// Store-assigned, increasing in append order.
    pub id: i64,
    pub job_id: JobId,
    pub level: LogLevel,
    pub message: String,
    pub metadata: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
}

impl JobLogEntry {
    pub fn from_new(id: i64, entry: NewLogEntry) -> Self {
        Self {
            id,
            job_id: entry.job_id,
            level: entry.level,
            message: entry.message,
            metadata: entry.metadata,
            created_at: entry.created_at,
        }
    }
}
