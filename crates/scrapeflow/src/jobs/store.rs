use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::jobs::model::{Job, JobLog, JobPatch, JobStatus, LogLevel, NewJob, Screenshot};

pub const DEFAULT_LIST_LIMIT: i64 = 20;

#[derive(Debug, Clone)]
pub struct ListFilter {
    pub status: Option<JobStatus>,
    pub site: Option<String>,
    pub limit: i64,
    pub offset: i64,
    /// Newest-first unless set. The recovery scan reads oldest-first.
    pub oldest_first: bool,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            status: None,
            site: None,
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
            oldest_first: false,
        }
    }
}

impl ListFilter {
    pub fn with_status(status: JobStatus, limit: i64) -> Self {
        Self {
            status: Some(status),
            limit,
            ..Default::default()
        }
    }
}

/// CRUD contract the queue and the worker need from persistent storage.
///
/// Implementations must treat `update_job_status` as a partial write: only
/// the fields set on the patch change.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: NewJob) -> anyhow::Result<Job>;

    async fn get_job(&self, id: Uuid) -> anyhow::Result<Option<Job>>;

    async fn update_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        patch: JobPatch,
    ) -> anyhow::Result<()>;

    /// Conditional queued -> running transition. `false` when the job is
    /// missing or no longer queued.
    async fn claim_job(&self, id: Uuid, started_at: DateTime<Utc>) -> anyhow::Result<bool>;

    async fn list_jobs(&self, filter: &ListFilter) -> anyhow::Result<Vec<Job>>;

    async fn append_log(&self, job_id: Uuid, level: LogLevel, message: &str)
        -> anyhow::Result<()>;

    async fn list_logs(&self, job_id: Uuid) -> anyhow::Result<Vec<JobLog>>;

    async fn record_screenshot(
        &self,
        job_id: Uuid,
        file_path: &str,
        context: &str,
    ) -> anyhow::Result<()>;

    async fn list_screenshots(&self, job_id: Uuid) -> anyhow::Result<Vec<Screenshot>>;
}
