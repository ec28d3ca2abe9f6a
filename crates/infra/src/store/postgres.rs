//! Postgres-backed job store implementation.
//!
//! ## Compare-and-swap
//!
//! Every lifecycle change is a single statement of the form
//!
//! ```sql
//! UPDATE jobs SET status = $3, ... WHERE id = $1 AND status = $2 RETURNING ...
//! ```
//!
//! Postgres row locking makes this atomic, so several dispatchers may poll the
//! same table: the loser of a claim race gets no row back and skips the job.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` on insert, `Storage` otherwise |
//! | Database (check violation) | `23514` | `Storage` |
//! | Column decode failures | N/A | `Serialization` |
//! | Anything else | N/A | `Storage` |
//!
//! ## Runtime
//!
//! The [`JobStore`] trait is synchronous. The trait methods block on the Tokio
//! runtime handle captured at construction, so they must be called from a
//! thread that is not itself driving async tasks (the job worker thread, or
//! `tokio::task::spawn_blocking`). The async inherent methods can be used
//! directly from async code.

use std::future::Future;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row};
use tokio::runtime::Handle;
use tracing::instrument;
use uuid::Uuid;

use jobforge_core::{Job, JobId, JobPayload, JobStatus, OwnerId, Transition};

use super::r#trait::{JobStats, JobStore, JobStoreError};

const MIGRATION: &str = include_str!("../../migrations/0001_create_jobs.sql");

const JOB_COLUMNS: &str = "id, job_type, name, payload, priority, status, attempts, max_attempts, \
     scheduled_for, next_retry_at, started_at, last_attempt_at, completed_at, progress, \
     progress_message, error_message, stack_trace, result, owner_id, created_at, updated_at";

/// Create the `jobs` and `job_logs` tables if they do not exist.
pub async fn migrate(pool: &PgPool) -> Result<(), JobStoreError> {
    sqlx::raw_sql(MIGRATION)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("migrate", e))?;
    Ok(())
}

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    runtime: Handle,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    /// Capture the runtime of the calling async context.
    pub fn from_current_runtime(pool: PgPool) -> Result<Self, JobStoreError> {
        let runtime = Handle::try_current().map_err(|_| {
            JobStoreError::Storage("PostgresJobStore requires a tokio runtime".to_string())
        })?;
        Ok(Self::new(pool, runtime))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type), err)]
    pub async fn insert_job(&self, job: &Job) -> Result<JobId, JobStoreError> {
        insert_job_row(&self.pool, job).await?;
        Ok(job.id)
    }

    /// Insert a batch inside one transaction.
    #[instrument(skip(self, jobs), fields(batch_size = jobs.len()), err)]
    pub async fn insert_jobs(&self, jobs: &[Job]) -> Result<Vec<JobId>, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for job in jobs {
            if let Err(err) = insert_job_row(&mut *tx, job).await {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(err);
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(jobs.iter().map(|j| j.id).collect())
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE status = 'pending' \
               AND scheduled_for <= $1 \
               AND (next_retry_at IS NULL OR next_retry_at <= $1) \
             ORDER BY priority DESC, scheduled_for ASC, created_at ASC \
             LIMIT $2"
        );

        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_due", e))?;

        rows.iter().map(job_from_row).collect()
    }

    /// Conditional update; see the module docs.
    #[instrument(
        skip(self, transition),
        fields(job_id = %job_id, transition = transition.name()),
        err
    )]
    pub async fn apply_transition(
        &self,
        job_id: JobId,
        expected: JobStatus,
        transition: &Transition,
    ) -> Result<Option<Job>, JobStoreError> {
        transition.check_from(expected)?;

        let id = *job_id.as_uuid();
        let expected = expected.as_str();
        let target = transition.target().as_str();

        let row = match transition {
            Transition::Claim { at } => {
                let sql = update_sql(
                    "attempts = attempts + 1, started_at = COALESCE(started_at, $4), \
                     last_attempt_at = $4, progress = 0, progress_message = NULL",
                );
                sqlx::query(&sql)
                    .bind(id)
                    .bind(expected)
                    .bind(target)
                    .bind(*at)
                    .fetch_optional(&self.pool)
                    .await
            }
            Transition::Complete { result, at } => {
                let sql = update_sql(
                    "completed_at = $4, progress = 100, result = $5, next_retry_at = NULL",
                );
                sqlx::query(&sql)
                    .bind(id)
                    .bind(expected)
                    .bind(target)
                    .bind(*at)
                    .bind(result)
                    .fetch_optional(&self.pool)
                    .await
            }
            Transition::ScheduleRetry {
                failure,
                retry_at,
                at,
            } => {
                let sql = update_sql("error_message = $5, stack_trace = $6, next_retry_at = $7");
                sqlx::query(&sql)
                    .bind(id)
                    .bind(expected)
                    .bind(target)
                    .bind(*at)
                    .bind(&failure.message)
                    .bind(&failure.stack_trace)
                    .bind(*retry_at)
                    .fetch_optional(&self.pool)
                    .await
            }
            Transition::Fail { failure, at } => {
                let sql = update_sql(
                    "error_message = $5, stack_trace = $6, next_retry_at = NULL, completed_at = $4",
                );
                sqlx::query(&sql)
                    .bind(id)
                    .bind(expected)
                    .bind(target)
                    .bind(*at)
                    .bind(&failure.message)
                    .bind(&failure.stack_trace)
                    .fetch_optional(&self.pool)
                    .await
            }
            Transition::Reject { message, at } => {
                let sql = update_sql("error_message = $5, stack_trace = NULL, completed_at = $4");
                sqlx::query(&sql)
                    .bind(id)
                    .bind(expected)
                    .bind(target)
                    .bind(*at)
                    .bind(message)
                    .fetch_optional(&self.pool)
                    .await
            }
            Transition::Cancel { at } => {
                let sql = update_sql("completed_at = $4, next_retry_at = NULL");
                sqlx::query(&sql)
                    .bind(id)
                    .bind(expected)
                    .bind(target)
                    .bind(*at)
                    .fetch_optional(&self.pool)
                    .await
            }
            Transition::Requeue { at } => {
                let sql = update_sql(
                    "attempts = 0, error_message = NULL, stack_trace = NULL, \
                     next_retry_at = NULL, completed_at = NULL, progress = 0, \
                     progress_message = NULL",
                );
                sqlx::query(&sql)
                    .bind(id)
                    .bind(expected)
                    .bind(target)
                    .bind(*at)
                    .fetch_optional(&self.pool)
                    .await
            }
            Transition::Progress {
                percent,
                message,
                at,
            } => {
                let sql =
                    update_sql("progress = $5, progress_message = COALESCE($6, progress_message)");
                sqlx::query(&sql)
                    .bind(id)
                    .bind(expected)
                    .bind(target)
                    .bind(*at)
                    .bind(i16::from((*percent).min(100)))
                    .bind(message)
                    .fetch_optional(&self.pool)
                    .await
            }
        }
        .map_err(|e| map_sqlx_error("transition", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_by_status(
        &self,
        status: JobStatus,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = $1 \
             ORDER BY created_at ASC, id ASC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(sql_limit(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_by_status", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn purge_finished_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobId>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND completed_at < $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_finished_before", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<Uuid, _>("id")
                    .map(JobId::from_uuid)
                    .map_err(|e| JobStoreError::Serialization(format!("failed to read id: {e}")))
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    pub async fn count_by_status(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_by_status", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| JobStoreError::Serialization(format!("failed to read status: {e}")))?;
            let count: i64 = row
                .try_get("n")
                .map_err(|e| JobStoreError::Serialization(format!("failed to read count: {e}")))?;
            let status: JobStatus = status
                .parse()
                .map_err(|e| JobStoreError::Serialization(format!("{e}")))?;
            stats.record(status, count.max(0) as u64);
        }
        Ok(stats)
    }
}

impl JobStore for PostgresJobStore {
    fn create(&self, job: Job) -> Result<JobId, JobStoreError> {
        self.block_on(self.insert_job(&job))
    }

    fn create_batch(&self, jobs: Vec<Job>) -> Result<Vec<JobId>, JobStoreError> {
        self.block_on(self.insert_jobs(&jobs))
    }

    fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.fetch_due(now, limit))
    }

    fn transition(
        &self,
        job_id: JobId,
        expected: JobStatus,
        transition: &Transition,
    ) -> Result<Option<Job>, JobStoreError> {
        self.block_on(self.apply_transition(job_id, expected, transition))
    }

    fn find_by_id(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.block_on(self.fetch_job(job_id))
    }

    fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.fetch_by_status(status, limit))
    }

    fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>, JobStoreError> {
        self.block_on(self.purge_finished_before(cutoff))
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.block_on(self.count_by_status())
    }
}

/// `UPDATE` guarded by the expected status.
///
/// Binds: `$1` id, `$2` expected status, `$3` target status, `$4` timestamp.
fn update_sql(set: &str) -> String {
    format!(
        "UPDATE jobs SET status = $3, updated_at = $4, {set} \
         WHERE id = $1 AND status = $2 \
         RETURNING {JOB_COLUMNS}"
    )
}

/// `LIMIT` argument; anything past `i64::MAX` means no limit.
pub(crate) fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn sql_count(value: u32, column: &str) -> Result<i32, JobStoreError> {
    i32::try_from(value)
        .map_err(|_| JobStoreError::Serialization(format!("{column} out of range: {value}")))
}

async fn insert_job_row<'e, E>(executor: E, job: &Job) -> Result<(), JobStoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let attempts = sql_count(job.attempts, "attempts")?;
    let max_attempts = sql_count(job.max_attempts, "max_attempts")?;
    sqlx::query(
        r#"
        INSERT INTO jobs (
            id, job_type, name, payload, priority, status, attempts, max_attempts,
            scheduled_for, next_retry_at, started_at, last_attempt_at, completed_at,
            progress, progress_message, error_message, stack_trace, result, owner_id,
            created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(&job.job_type)
    .bind(&job.name)
    .bind(job.payload.as_value())
    .bind(job.priority)
    .bind(job.status.as_str())
    .bind(attempts)
    .bind(max_attempts)
    .bind(job.scheduled_for)
    .bind(job.next_retry_at)
    .bind(job.started_at)
    .bind(job.last_attempt_at)
    .bind(job.completed_at)
    .bind(i16::from(job.progress))
    .bind(&job.progress_message)
    .bind(&job.error_message)
    .bind(&job.stack_trace)
    .bind(&job.result)
    .bind(job.owner_id.map(Uuid::from))
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(executor)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            JobStoreError::AlreadyExists(job.id)
        } else {
            map_sqlx_error("insert_job", e)
        }
    })?;

    Ok(())
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            JobStoreError::Storage(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::ColumnDecode { index, source } => JobStoreError::Serialization(format!(
            "failed to decode column {index} in {operation}: {source}"
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let row = JobRow::from_row(row)
        .map_err(|e| JobStoreError::Serialization(format!("failed to deserialize job row: {e}")))?;
    Job::try_from(row)
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: Uuid,
    job_type: String,
    name: String,
    payload: serde_json::Value,
    priority: i32,
    status: String,
    attempts: i32,
    max_attempts: i32,
    scheduled_for: DateTime<Utc>,
    next_retry_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    last_attempt_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    progress: i16,
    progress_message: Option<String>,
    error_message: Option<String>,
    stack_trace: Option<String>,
    result: Option<serde_json::Value>,
    owner_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            name: row.try_get("name")?,
            payload: row.try_get("payload")?,
            priority: row.try_get("priority")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            scheduled_for: row.try_get("scheduled_for")?,
            next_retry_at: row.try_get("next_retry_at")?,
            started_at: row.try_get("started_at")?,
            last_attempt_at: row.try_get("last_attempt_at")?,
            completed_at: row.try_get("completed_at")?,
            progress: row.try_get("progress")?,
            progress_message: row.try_get("progress_message")?,
            error_message: row.try_get("error_message")?,
            stack_trace: row.try_get("stack_trace")?,
            result: row.try_get("result")?,
            owner_id: row.try_get("owner_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| JobStoreError::Serialization(e.to_string()))?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            job_type: row.job_type,
            name: row.name,
            payload: JobPayload::new(row.payload),
            priority: row.priority,
            status,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            scheduled_for: row.scheduled_for,
            next_retry_at: row.next_retry_at,
            started_at: row.started_at,
            last_attempt_at: row.last_attempt_at,
            completed_at: row.completed_at,
            progress: row.progress.clamp(0, 100) as u8,
            progress_message: row.progress_message,
            error_message: row.error_message,
            stack_trace: row.stack_trace,
            result: row.result,
            owner_id: row.owner_id.map(OwnerId::from_uuid),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_limits_saturate() {
        assert_eq!(sql_limit(25), 25);
        assert_eq!(sql_limit(usize::MAX), i64::MAX);
    }

    #[test]
    fn attempt_counts_must_fit_the_column() {
        assert_eq!(sql_count(3, "max_attempts").unwrap(), 3);
        assert!(matches!(
            sql_count(u32::MAX, "max_attempts"),
            Err(JobStoreError::Serialization(msg)) if msg.contains("max_attempts")
        ));
    }

    #[test]
    fn update_sql_guards_on_expected_status() {
        let sql = update_sql("completed_at = $4");
        assert!(sql.contains("WHERE id = $1 AND status = $2"));
        assert!(sql.contains("SET status = $3, updated_at = $4, completed_at = $4"));
        assert!(sql.ends_with(&format!("RETURNING {JOB_COLUMNS}")));
    }

    #[test]
    fn migration_creates_both_tables() {
        assert!(MIGRATION.contains("CREATE TABLE IF NOT EXISTS jobs"));
        assert!(MIGRATION.contains("REFERENCES jobs (id) ON DELETE CASCADE"));
    }

    fn row(status: &str, progress: i16) -> JobRow {
        let now = Utc::now();
        JobRow {
            id: Uuid::now_v7(),
            job_type: "send_email".to_string(),
            name: "Send".to_string(),
            payload: serde_json::json!({"to": "x@example.com"}),
            priority: 3,
            status: status.to_string(),
            attempts: 1,
            max_attempts: 3,
            scheduled_for: now,
            next_retry_at: None,
            started_at: Some(now),
            last_attempt_at: Some(now),
            completed_at: None,
            progress,
            progress_message: Some("sending".to_string()),
            error_message: None,
            stack_trace: None,
            result: None,
            owner_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn rows_convert_into_jobs() {
        let job = Job::try_from(row("processing", 40)).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.progress, 40);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.payload.as_value()["to"], "x@example.com");
    }

    #[test]
    fn unknown_status_is_a_serialization_error() {
        let err = Job::try_from(row("running", 0)).unwrap_err();
        assert!(matches!(err, JobStoreError::Serialization(_)));
    }
}
