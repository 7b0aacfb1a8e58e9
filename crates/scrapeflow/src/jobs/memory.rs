use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::jobs::model::{Job, JobLog, JobPatch, JobStatus, LogLevel, NewJob, Screenshot};
use crate::jobs::store::{JobStore, ListFilter};

/// In-process job store. Same contract as the Postgres repo; nothing survives
/// the process, so it suits tests and single-shot runs.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    logs: Mutex<Vec<JobLog>>,
    screenshots: Mutex<Vec<Screenshot>>,
    next_row_id: AtomicI64,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a fully-formed record, e.g. one left behind by a previous process.
    pub fn insert(&self, job: Job) {
        lock(&self.jobs).insert(job.id, job);
    }

    fn row_id(&self) -> i64 {
        self.next_row_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: NewJob) -> anyhow::Result<Job> {
        let record = Job {
            id: Uuid::new_v4(),
            site: job.site,
            job_type: job.job_type,
            parameters: job.parameters,
            format: job.format,
            headless: job.headless,
            webhook_url: job.webhook_url,
            status: JobStatus::Queued,
            pages_scraped: 0,
            items_extracted: 0,
            result_file_path: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
        };

        lock(&self.jobs).insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_job(&self, id: Uuid) -> anyhow::Result<Option<Job>> {
        Ok(lock(&self.jobs).get(&id).cloned())
    }

    async fn update_job_status(
        &self,
        id: Uuid,
        status: JobStatus,
        patch: JobPatch,
    ) -> anyhow::Result<()> {
        let mut jobs = lock(&self.jobs);
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(());
        };

        job.status = status;
        if let Some(v) = patch.started_at {
            job.started_at = Some(v);
        }
        if let Some(v) = patch.finished_at {
            job.finished_at = Some(v);
        }
        if let Some(v) = patch.duration_ms {
            job.duration_ms = Some(v);
        }
        if let Some(v) = patch.pages_scraped {
            job.pages_scraped = v;
        }
        if let Some(v) = patch.items_extracted {
            job.items_extracted = v;
        }
        if let Some(v) = patch.result_file_path {
            job.result_file_path = Some(v);
        }
        if let Some(v) = patch.error_message {
            job.error_message = Some(v);
        }

        Ok(())
    }

    async fn claim_job(&self, id: Uuid, started_at: DateTime<Utc>) -> anyhow::Result<bool> {
        let mut jobs = lock(&self.jobs);
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Queued => {
                job.status = JobStatus::Running;
                job.started_at = Some(started_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_jobs(&self, filter: &ListFilter) -> anyhow::Result<Vec<Job>> {
        let mut out: Vec<Job> = lock(&self.jobs)
            .values()
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .filter(|j| filter.site.as_deref().map_or(true, |s| j.site == s))
            .cloned()
            .collect();

        out.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        if !filter.oldest_first {
            out.reverse();
        }

        Ok(out
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(1) as usize)
            .collect())
    }

    async fn append_log(
        &self,
        job_id: Uuid,
        level: LogLevel,
        message: &str,
    ) -> anyhow::Result<()> {
        let entry = JobLog {
            id: self.row_id(),
            job_id,
            level,
            message: message.to_string(),
            created_at: Utc::now(),
        };
        lock(&self.logs).push(entry);
        Ok(())
    }

    async fn list_logs(&self, job_id: Uuid) -> anyhow::Result<Vec<JobLog>> {
        Ok(lock(&self.logs)
            .iter()
            .filter(|l| l.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn record_screenshot(
        &self,
        job_id: Uuid,
        file_path: &str,
        context: &str,
    ) -> anyhow::Result<()> {
        let entry = Screenshot {
            id: self.row_id(),
            job_id,
            file_path: file_path.to_string(),
            context: context.to_string(),
            created_at: Utc::now(),
        };
        lock(&self.screenshots).push(entry);
        Ok(())
    }

    async fn list_screenshots(&self, job_id: Uuid) -> anyhow::Result<Vec<Screenshot>> {
        Ok(lock(&self.screenshots)
            .iter()
            .filter(|s| s.job_id == job_id)
            .cloned()
            .collect())
    }
}
