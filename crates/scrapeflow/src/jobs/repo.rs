// crates/scrapeflow/src/jobs/repo.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::jobs::model::{Job, JobLog, JobPatch, JobStatus, LogLevel, NewJob, Screenshot};
use crate::jobs::store::{JobStore, ListFilter};

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    site: String,
    job_type: String,
    parameters: Value,
    format: String,
    headless: bool,
    webhook_url: Option<String>,
    status: String,
    pages_scraped: i32,
    items_extracted: i32,
    result_file_path: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
}

impl TryFrom<JobRow> for Job {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            site: row.site,
            job_type: row.job_type.parse()?,
            parameters: row.parameters,
            format: row.format.parse()?,
            headless: row.headless,
            webhook_url: row.webhook_url,
            status: row.status.parse()?,
            pages_scraped: row.pages_scraped,
            items_extracted: row.items_extracted,
            result_file_path: row.result_file_path,
            error_message: row.error_message,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            duration_ms: row.duration_ms,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobLogRow {
    id: i64,
    job_id: Uuid,
    level: String,
    message: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct ScreenshotRow {
    id: i64,
    job_id: Uuid,
    file_path: String,
    context: String,
    created_at: DateTime<Utc>,
}

const JOB_COLUMNS: &str = r#"
    id, site, job_type, parameters, format, headless, webhook_url,
    status, pages_scraped, items_extracted,
    result_file_path, error_message,
    created_at, started_at, finished_at, duration_ms
"#;

/// Postgres-backed job store.
#[derive(Clone)]
pub struct JobsRepo {
    pool: PgPool,
}

impl JobsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for JobsRepo {
    // ----------------------------
    // Jobs
    // ----------------------------

    async fn create_job(&self, job: NewJob) -> anyhow::Result<Job> {
        let sql = format!(
            r#"
            INSERT INTO jobs (id, site, job_type, parameters, format, headless, webhook_url, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(&job.site)
            .bind(job.job_type.as_str())
            .bind(&job.parameters)
            .bind(job.format.as_str())
            .bind(job.headless)
            .bind(&job.webhook_url)
            .bind(JobStatus::Queued.as_str())
            .fetch_one(&self.pool)
            .await?;

        row.try_into()
    }

    async fn get_job(&self, id: Uuid) -> anyhow::Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Job::try_from).transpose()
    }

    async fn update_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        patch: JobPatch,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                started_at = COALESCE($3, started_at),
                finished_at = COALESCE($4, finished_at),
                duration_ms = COALESCE($5, duration_ms),
                pages_scraped = COALESCE($6, pages_scraped),
                items_extracted = COALESCE($7, items_extracted),
                result_file_path = COALESCE($8, result_file_path),
                error_message = COALESCE($9, error_message)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(patch.started_at)
        .bind(patch.finished_at)
        .bind(patch.duration_ms)
        .bind(patch.pages_scraped)
        .bind(patch.items_extracted)
        .bind(patch.result_file_path)
        .bind(patch.error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn claim_job(&self, id: Uuid, started_at: DateTime<Utc>) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running',
                started_at = $2
            WHERE id = $1
              AND status = 'queued'
            "#,
        )
        .bind(id)
        .bind(started_at)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn list_jobs(&self, filter: &ListFilter) -> anyhow::Result<Vec<Job>> {
        let order = if filter.oldest_first { "ASC" } else { "DESC" };
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR site = $2)
            ORDER BY created_at {order}, id {order}
            LIMIT $3
            OFFSET $4
            "#
        );

        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.site.as_deref())
            .bind(filter.limit.max(1))
            .bind(filter.offset.max(0))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    // ----------------------------
    // Logs / screenshots
    // ----------------------------

    async fn append_log(
        &self,
        job_id: Uuid,
        level: LogLevel,
        message: &str,
    ) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO job_logs (job_id, level, message) VALUES ($1, $2, $3)")
            .bind(job_id)
            .bind(level.as_str())
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_logs(&self, job_id: Uuid) -> anyhow::Result<Vec<JobLog>> {
        let rows = sqlx::query_as::<_, JobLogRow>(
            r#"
            SELECT id, job_id, level, message, created_at
            FROM job_logs
            WHERE job_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| -> anyhow::Result<JobLog> {
                Ok(JobLog {
                    id: r.id,
                    job_id: r.job_id,
                    level: r.level.parse()?,
                    message: r.message,
                    created_at: r.created_at,
                })
            })
            .collect()
    }

    async fn record_screenshot(
        &self,
        job_id: Uuid,
        file_path: &str,
        context: &str,
    ) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO screenshots (job_id, file_path, context) VALUES ($1, $2, $3)")
            .bind(job_id)
            .bind(file_path)
            .bind(context)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_screenshots(&self, job_id: Uuid) -> anyhow::Result<Vec<Screenshot>> {
        let rows = sqlx::query_as::<_, ScreenshotRow>(
            r#"
            SELECT id, job_id, file_path, context, created_at
            FROM screenshots
            WHERE job_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Screenshot {
                id: r.id,
                job_id: r.job_id,
                file_path: r.file_path,
                context: r.context,
                created_at: r.created_at,
            })
            .collect())
    }
}
