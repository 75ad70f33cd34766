//! Postgres-backed job store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | `UPDATE` matched no row, record exists | - | `StatusConflict` |
//! | `UPDATE` matched no row, no record | - | `NotFound` |
//! | Anything else | - | `Storage` |
//!
//! Uses runtime-checked queries so the crate builds without a live database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use castline_core::{Job, JobId, JobStatus, TraceId};

use super::store::{order_by_request, JobStore, JobStoreError};

const SELECT_COLUMNS: &str =
    "SELECT id, trace_id, job_type, status, result_url, message, created_at, updated_at FROM jobs";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

fn storage(e: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn row_to_job(row: &PgRow) -> Result<Job, JobStoreError> {
    let id: Uuid = row.try_get("id").map_err(storage)?;
    let trace_id: Uuid = row.try_get("trace_id").map_err(storage)?;
    let status: String = row.try_get("status").map_err(storage)?;
    let status: JobStatus = status
        .parse()
        .map_err(|e: castline_core::DomainError| JobStoreError::Storage(e.to_string()))?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(storage)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(storage)?;

    Ok(Job {
        id: JobId::from_uuid(id),
        trace_id: TraceId::from_uuid(trace_id),
        job_type: row.try_get("job_type").map_err(storage)?,
        status,
        result_url: row.try_get("result_url").map_err(storage)?,
        message: row.try_get("message").map_err(storage)?,
        created_at,
        updated_at,
    })
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(storage)?;
        Ok(Self::new(pool))
    }

    /// Create the `jobs` table if it does not exist.
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id          UUID PRIMARY KEY,
                trace_id    UUID NOT NULL,
                job_type    TEXT NOT NULL,
                status      TEXT NOT NULL,
                result_url  TEXT NULL,
                message     TEXT NULL,
                created_at  TIMESTAMPTZ NOT NULL,
                updated_at  TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS jobs_trace_id_idx ON jobs (trace_id)")
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn create(&self, job: Job) -> Result<(), JobStoreError> {
        sqlx::query(
            "INSERT INTO jobs (id, trace_id, job_type, status, result_url, message, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(*job.id.as_uuid())
        .bind(*job.trace_id.as_uuid())
        .bind(&job.job_type)
        .bind(job.status.as_str())
        .bind(&job.result_url)
        .bind(&job.message)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                storage(e)
            }
        })?;
        Ok(())
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn find_by_ids(&self, ids: &[JobId]) -> Result<Vec<Job>, JobStoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let uuids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ANY($1)"))
            .bind(&uuids)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;

        let jobs = rows.iter().map(row_to_job).collect::<Result<Vec<_>, _>>()?;
        Ok(order_by_request(ids, jobs))
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status, expected = %expected), err)]
    async fn update(&self, job: &Job, expected: JobStatus) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = $2, result_url = $3, message = $4, updated_at = $5 \
             WHERE id = $1 AND status = $6",
        )
        .bind(*job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(&job.result_url)
        .bind(&job.message)
        .bind(job.updated_at)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        let exists = sqlx::query("SELECT 1 FROM jobs WHERE id = $1")
            .bind(*job.id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .is_some();
        if exists {
            Err(JobStoreError::StatusConflict { id: job.id, expected })
        } else {
            Err(JobStoreError::NotFound(job.id))
        }
    }
}
