//! Postgres-backed job log store.
//!
//! Rows live in `job_logs` (see `migrations/0001_create_jobs.sql`). The
//! foreign key to `jobs` cascades, so retention cleanup of a job removes its
//! trail even without [`JobLogStore::delete_for_jobs`].

use std::future::Future;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;
use uuid::Uuid;

use jobforge_core::{JobId, JobLogEntry, LogLevel, NewLogEntry};

use super::{JobLogStore, JobLogStoreError};
use crate::store::postgres::sql_limit;

#[derive(Debug, Clone)]
pub struct PostgresJobLogStore {
    pool: PgPool,
    runtime: Handle,
}

impl PostgresJobLogStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    #[instrument(skip(self, entry), fields(job_id = %entry.job_id, level = %entry.level), err)]
    pub async fn insert_entry(&self, entry: NewLogEntry) -> Result<JobLogEntry, JobLogStoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO job_logs (job_id, level, message, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(entry.job_id.as_uuid())
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_entry", e))?;

        let id: i64 = row
            .try_get("id")
            .map_err(|e| JobLogStoreError::Serialization(format!("failed to read id: {e}")))?;

        Ok(JobLogEntry::from_new(id, entry))
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_recent(
        &self,
        job_id: JobId,
        limit: usize,
    ) -> Result<Vec<JobLogEntry>, JobLogStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, level, message, metadata, created_at
            FROM job_logs
            WHERE job_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_recent", e))?;

        rows.iter()
            .map(|row| {
                LogRow::from_row(row)
                    .map_err(|e| {
                        JobLogStoreError::Serialization(format!("failed to deserialize log row: {e}"))
                    })
                    .and_then(JobLogEntry::try_from)
            })
            .collect()
    }

    #[instrument(skip(self, job_ids), fields(jobs = job_ids.len()), err)]
    pub async fn purge_for_jobs(&self, job_ids: &[JobId]) -> Result<u64, JobLogStoreError> {
        if job_ids.is_empty() {
            return Ok(0);
        }

        let ids: Vec<Uuid> = job_ids.iter().map(|id| *id.as_uuid()).collect();
        let result = sqlx::query("DELETE FROM job_logs WHERE job_id = ANY($1)")
            .bind(&ids)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_for_jobs", e))?;

        Ok(result.rows_affected())
    }
}

impl JobLogStore for PostgresJobLogStore {
    fn append(&self, entry: NewLogEntry) -> Result<JobLogEntry, JobLogStoreError> {
        self.block_on(self.insert_entry(entry))
    }

    fn recent(&self, job_id: JobId, limit: usize) -> Result<Vec<JobLogEntry>, JobLogStoreError> {
        self.block_on(self.fetch_recent(job_id, limit))
    }

    fn delete_for_jobs(&self, job_ids: &[JobId]) -> Result<u64, JobLogStoreError> {
        self.block_on(self.purge_for_jobs(job_ids))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobLogStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobLogStoreError::Storage(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        sqlx::Error::ColumnDecode { index, source } => JobLogStoreError::Serialization(format!(
            "failed to decode column {index} in {operation}: {source}"
        )),
        _ => JobLogStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

#[derive(Debug)]
struct LogRow {
    id: i64,
    job_id: Uuid,
    level: String,
    message: String,
    metadata: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for LogRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(LogRow {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            level: row.try_get("level")?,
            message: row.try_get("message")?,
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<LogRow> for JobLogEntry {
    type Error = JobLogStoreError;

    fn try_from(row: LogRow) -> Result<Self, Self::Error> {
        let level = row
            .level
            .parse::<LogLevel>()
            .map_err(|e| JobLogStoreError::Serialization(e.to_string()))?;

        Ok(JobLogEntry {
            id: row.id,
            job_id: JobId::from_uuid(row.job_id),
            level,
            message: row.message,
            metadata: row.metadata,
            created_at: row.created_at,
        })
    }
}
