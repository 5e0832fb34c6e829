use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::detection::ResultPayload;
use crate::models::job::{Job, JobStatus, JobTransition};
use crate::services::job_store::{JobFilter, JobStore, StoreError};

const JOB_COLUMNS: &str = r#"
    id, status, model_name, image_ref, content_type, file_size, original_filename,
    created_at, started_at, completed_at, result_payload, error_detail,
    worker_token, callback_target
"#;

/// PostgreSQL-backed job store.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let status_str: String = row.try_get("status")?;
    let status = status_str
        .parse::<JobStatus>()
        .map_err(|_| StoreError::Corrupt(format!("unknown status '{status_str}'")))?;
    let result_payload: Option<Json<ResultPayload>> = row.try_get("result_payload")?;

    Ok(Job {
        id: row.try_get("id")?,
        status,
        model_name: row.try_get("model_name")?,
        image_ref: row.try_get("image_ref")?,
        content_type: row.try_get("content_type")?,
        file_size: row.try_get("file_size")?,
        original_filename: row.try_get("original_filename")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        result_payload: result_payload.map(|Json(p)| p),
        error_detail: row.try_get("error_detail")?,
        worker_token: row.try_get("worker_token")?,
        callback_target: row.try_get("callback_target")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: &Job) -> Result<Uuid, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, status, model_name, image_ref, content_type, file_size,
                              original_filename, created_at, callback_target)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(job.id)
        .bind(job.status.to_string())
        .bind(&job.model_name)
        .bind(&job.image_ref)
        .bind(&job.content_type)
        .bind(job.file_size)
        .bind(&job.original_filename)
        .bind(job.created_at)
        .bind(&job.callback_target)
        .execute(&self.pool)
        .await?;

        Ok(job.id)
    }

    async fn get(&self, id: Uuid) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => job_from_row(&r),
            None => Err(StoreError::NotFound(id)),
        }
    }

    /// Lock the row, run the transition through [`Job::apply`], write it back.
    async fn update(&self, id: Uuid, transition: JobTransition) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound(id))?;

        let mut job = job_from_row(&row)?;
        job.apply(transition)?;

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $1,
                started_at = $2,
                completed_at = $3,
                result_payload = $4,
                error_detail = $5,
                worker_token = $6
            WHERE id = $7
            "#,
        )
        .bind(job.status.to_string())
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.result_payload.clone().map(Json))
        .bind(&job.error_detail)
        .bind(&job.worker_token)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(job)
    }

    async fn list_by(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let statuses: Vec<String> = filter.statuses.iter().map(|s| s.to_string()).collect();

        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE (cardinality($1::text[]) = 0 OR status = ANY($1::text[]))
              AND ($2::timestamptz IS NULL OR completed_at < $2)
            ORDER BY created_at ASC
            LIMIT $3
            "#
        ))
        .bind(statuses)
        .bind(filter.completed_before)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
