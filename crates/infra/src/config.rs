//! Engine configuration.
//!
//! Values are read into a [`JobsConfigLayer`] (every field optional), layers
//! are merged (later wins), and [`JobsConfigLayer::finalize`] fills in
//! defaults. The worker binary builds its layer from the environment:
//!
//! | Variable | Default |
//! |---|---|
//! | `DATABASE_URL` | none |
//! | `JOBFORGE_POLL_INTERVAL_MS` | 5000 |
//! | `JOBFORGE_BATCH_SIZE` | 10 |
//! | `JOBFORGE_MAX_CONCURRENT` | 1 |
//! | `JOBFORGE_DEFAULT_MAX_ATTEMPTS` | 3 |
//! | `JOBFORGE_RETRY_BASE_SECS` | 60 |
//! | `JOBFORGE_RETENTION_DAYS` | 30 |
//! | `JOBFORGE_CLEANUP_INTERVAL_SECS` | 3600 (0 disables) |
//! | `JOBFORGE_DB_MAX_CONNECTIONS` | 5 |
//! | `JOBFORGE_LOG_FORMAT` | `json` |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use jobforge_core::{DEFAULT_MAX_ATTEMPTS, RetryPolicy};
use jobforge_observability::LogFormat;

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_POLL_INTERVAL_MS: &str = "JOBFORGE_POLL_INTERVAL_MS";
pub const ENV_BATCH_SIZE: &str = "JOBFORGE_BATCH_SIZE";
pub const ENV_MAX_CONCURRENT: &str = "JOBFORGE_MAX_CONCURRENT";
pub const ENV_DEFAULT_MAX_ATTEMPTS: &str = "JOBFORGE_DEFAULT_MAX_ATTEMPTS";
pub const ENV_RETRY_BASE_SECS: &str = "JOBFORGE_RETRY_BASE_SECS";
pub const ENV_RETENTION_DAYS: &str = "JOBFORGE_RETENTION_DAYS";
pub const ENV_CLEANUP_INTERVAL_SECS: &str = "JOBFORGE_CLEANUP_INTERVAL_SECS";
pub const ENV_DB_MAX_CONNECTIONS: &str = "JOBFORGE_DB_MAX_CONNECTIONS";
pub const ENV_LOG_FORMAT: &str = "JOBFORGE_LOG_FORMAT";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("{0} must be set")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobsConfigLayer {
    pub database_url: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub batch_size: Option<usize>,
    pub max_concurrent: Option<usize>,
    pub default_max_attempts: Option<u32>,
    pub retry_base_secs: Option<u64>,
    pub retention_days: Option<u32>,
    pub cleanup_interval_secs: Option<u64>,
    pub db_max_connections: Option<u32>,
    pub log_format: Option<LogFormat>,
}

impl JobsConfigLayer {
    /// Read a layer from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Read a layer through an arbitrary variable lookup.
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let log_format = match lookup(ENV_LOG_FORMAT) {
            Some(value) => Some(value.parse::<LogFormat>().map_err(|_| ConfigError::Invalid {
                key: ENV_LOG_FORMAT,
                value,
            })?),
            None => None,
        };

        Ok(Self {
            database_url: lookup(ENV_DATABASE_URL).filter(|url| !url.trim().is_empty()),
            poll_interval_ms: parse_var(&lookup, ENV_POLL_INTERVAL_MS)?,
            batch_size: parse_var(&lookup, ENV_BATCH_SIZE)?,
            max_concurrent: parse_var(&lookup, ENV_MAX_CONCURRENT)?,
            default_max_attempts: parse_var(&lookup, ENV_DEFAULT_MAX_ATTEMPTS)?,
            retry_base_secs: parse_var(&lookup, ENV_RETRY_BASE_SECS)?,
            retention_days: parse_var(&lookup, ENV_RETENTION_DAYS)?,
            cleanup_interval_secs: parse_var(&lookup, ENV_CLEANUP_INTERVAL_SECS)?,
            db_max_connections: parse_var(&lookup, ENV_DB_MAX_CONNECTIONS)?,
            log_format,
        })
    }

    pub fn merge(&mut self, other: Self) {
        if other.database_url.is_some() {
            self.database_url = other.database_url;
        }
        if other.poll_interval_ms.is_some() {
            self.poll_interval_ms = other.poll_interval_ms;
        }
        if other.batch_size.is_some() {
            self.batch_size = other.batch_size;
        }
        if other.max_concurrent.is_some() {
            self.max_concurrent = other.max_concurrent;
        }
        if other.default_max_attempts.is_some() {
            self.default_max_attempts = other.default_max_attempts;
        }
        if other.retry_base_secs.is_some() {
            self.retry_base_secs = other.retry_base_secs;
        }
        if other.retention_days.is_some() {
            self.retention_days = other.retention_days;
        }
        if other.cleanup_interval_secs.is_some() {
            self.cleanup_interval_secs = other.cleanup_interval_secs;
        }
        if other.db_max_connections.is_some() {
            self.db_max_connections = other.db_max_connections;
        }
        if other.log_format.is_some() {
            self.log_format = other.log_format;
        }
    }

    /// Apply defaults and check ranges.
    pub fn finalize(self) -> Result<JobsConfig, ConfigError> {
        let batch_size = positive(ENV_BATCH_SIZE, self.batch_size.unwrap_or(10))?;
        let max_concurrent = positive(ENV_MAX_CONCURRENT, self.max_concurrent.unwrap_or(1))?;
        let default_max_attempts = positive(
            ENV_DEFAULT_MAX_ATTEMPTS,
            self.default_max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
        )?;
        let db_max_connections =
            positive(ENV_DB_MAX_CONNECTIONS, self.db_max_connections.unwrap_or(5))?;
        let retry_base_secs = positive(ENV_RETRY_BASE_SECS, self.retry_base_secs.unwrap_or(60))?;

        let cleanup_interval = match self.cleanup_interval_secs.unwrap_or(3600) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(JobsConfig {
            database_url: self.database_url,
            poll_interval: Duration::from_millis(self.poll_interval_ms.unwrap_or(5000)),
            batch_size,
            max_concurrent,
            default_max_attempts,
            retry_base: Duration::from_secs(retry_base_secs),
            retention_days: self.retention_days.unwrap_or(30),
            cleanup_interval,
            db_max_connections,
            log_format: self.log_format.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobsConfig {
    pub database_url: Option<String>,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub max_concurrent: usize,
    pub default_max_attempts: u32,
    pub retry_base: Duration,
    pub retention_days: u32,
    /// `None` disables the periodic retention sweep.
    pub cleanup_interval: Option<Duration>,
    pub db_max_connections: u32,
    pub log_format: LogFormat,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            poll_interval: Duration::from_millis(5000),
            batch_size: 10,
            max_concurrent: 1,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base: Duration::from_secs(60),
            retention_days: 30,
            cleanup_interval: Some(Duration::from_secs(3600)),
            db_max_connections: 5,
            log_format: LogFormat::Json,
        }
    }
}

impl JobsConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        JobsConfigLayer::from_env()?.finalize()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_base(self.retry_base)
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing(ENV_DATABASE_URL))
    }
}

fn parse_var<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(None),
    }
}

fn positive<T>(key: &'static str, value: T) -> Result<T, ConfigError>
where
    T: PartialOrd + Default + ToString,
{
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = JobsConfigLayer::from_vars(vars(&[])).unwrap().finalize().unwrap();
        assert_eq!(config, JobsConfig::default());
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(
            config.require_database_url(),
            Err(ConfigError::Missing(ENV_DATABASE_URL))
        );
    }

    #[test]
    fn reads_all_variables() {
        let config = JobsConfigLayer::from_vars(vars(&[
            (ENV_DATABASE_URL, "postgres://localhost/jobs"),
            (ENV_POLL_INTERVAL_MS, "250"),
            (ENV_BATCH_SIZE, "50"),
            (ENV_MAX_CONCURRENT, "4"),
            (ENV_DEFAULT_MAX_ATTEMPTS, "5"),
            (ENV_RETRY_BASE_SECS, "1"),
            (ENV_RETENTION_DAYS, "7"),
            (ENV_CLEANUP_INTERVAL_SECS, "0"),
            (ENV_DB_MAX_CONNECTIONS, "20"),
            (ENV_LOG_FORMAT, "Pretty"),
        ]))
        .unwrap()
        .finalize()
        .unwrap();

        assert_eq!(config.require_database_url(), Ok("postgres://localhost/jobs"));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.default_max_attempts, 5);
        assert_eq!(config.retry_base, Duration::from_secs(1));
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.cleanup_interval, None);
        assert_eq!(config.db_max_connections, 20);
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn rejects_unparseable_values() {
        let err = JobsConfigLayer::from_vars(vars(&[(ENV_BATCH_SIZE, "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: ENV_BATCH_SIZE,
                value: "lots".to_string()
            }
        );
        assert!(JobsConfigLayer::from_vars(vars(&[(ENV_LOG_FORMAT, "xml")])).is_err());
    }

    #[test]
    fn rejects_zero_where_a_positive_value_is_required() {
        let layer = JobsConfigLayer::from_vars(vars(&[(ENV_MAX_CONCURRENT, "0")])).unwrap();
        assert!(matches!(
            layer.finalize(),
            Err(ConfigError::Invalid { key: ENV_MAX_CONCURRENT, .. })
        ));
    }

    #[test]
    fn merge_prefers_the_overlay() {
        let mut base = JobsConfigLayer {
            batch_size: Some(10),
            retention_days: Some(90),
            ..Default::default()
        };
        base.merge(JobsConfigLayer {
            batch_size: Some(25),
            retention_days: None,
            ..Default::default()
        });

        assert_eq!(base.batch_size, Some(25));
        assert_eq!(base.retention_days, Some(90));
    }

    #[test]
    fn blank_database_url_counts_as_unset() {
        let layer = JobsConfigLayer::from_vars(vars(&[(ENV_DATABASE_URL, "  ")])).unwrap();
        assert!(layer.database_url.is_none());
    }
}
