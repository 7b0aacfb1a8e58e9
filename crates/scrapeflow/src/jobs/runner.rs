use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;

use crate::jobs::events::JobSummary;
use crate::jobs::model::{JobPatch, JobStatus, QueueJob};
use crate::jobs::store::JobStore;
use crate::scrape::worker::{ScrapeError, WorkerResult};

/// Runs one job end to end. [`crate::scrape::JobWorker`] is the production implementation.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &QueueJob) -> Result<WorkerResult, ScrapeError>;

    /// Releases browser resources once the queue has drained.
    async fn shutdown(&self) {}
}

#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(JobSummary),
    Failed(String),
}

/// Owns the status transitions around an executor call:
/// queued -> running -> completed | failed.
#[derive(Clone)]
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    executor: Arc<dyn JobExecutor>,
}

impl JobRunner {
    pub fn new(store: Arc<dyn JobStore>, executor: Arc<dyn JobExecutor>) -> Self {
        Self { store, executor }
    }

    pub fn executor(&self) -> &Arc<dyn JobExecutor> {
        &self.executor
    }

    /// Moves a still-queued job to running. Returns `false` when the record
    /// is gone or another dispatch already took it.
    pub async fn claim(&self, job: &QueueJob) -> anyhow::Result<bool> {
        self.store.claim_job(job.id, Utc::now()).await
    }

    /// Executes a claimed job and records the terminal status.
    pub async fn execute(&self, job: &QueueJob) -> anyhow::Result<JobOutcome> {
        let start = Instant::now();

        // A panicking executor must still leave a failed record behind.
        let executor = self.executor.clone();
        let task_job = job.clone();
        let result = match tokio::spawn(async move { executor.execute(&task_job).await }).await {
            Ok(result) => result,
            Err(join_err) => Err(ScrapeError::Panicked(join_err.to_string())),
        };

        let duration_ms = i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX);

        match result {
            Ok(res) => self.on_success(job, res, duration_ms).await,
            Err(err) => self.on_failure(job, err.to_string()).await,
        }
    }

    async fn on_success(
        &self,
        job: &QueueJob,
        res: WorkerResult,
        duration_ms: i64,
    ) -> anyhow::Result<JobOutcome> {
        let result_file_path = res.result_file_path.to_string_lossy().into_owned();

        let recorded = self
            .store
            .update_job_status(
                job.id,
                JobStatus::Completed,
                JobPatch {
                    finished_at: Some(Utc::now()),
                    duration_ms: Some(duration_ms),
                    pages_scraped: Some(i32::try_from(res.pages_scraped).unwrap_or(i32::MAX)),
                    items_extracted: Some(i32::try_from(res.items_extracted).unwrap_or(i32::MAX)),
                    result_file_path: Some(result_file_path.clone()),
                    ..Default::default()
                },
            )
            .await;

        // A job must not stay running because the completion write failed.
        if let Err(e) = recorded {
            tracing::error!(job_id = %job.id, error = %e, "failed to record completion");
            return self
                .on_failure(job, format!("failed to record completion: {e}"))
                .await;
        }

        Ok(JobOutcome::Completed(JobSummary {
            pages_scraped: res.pages_scraped,
            items_extracted: res.items_extracted,
            duration_ms,
            result_file_path,
            items: Arc::new(res.items),
        }))
    }

    async fn on_failure(&self, job: &QueueJob, message: String) -> anyhow::Result<JobOutcome> {
        self.store
            .update_job_status(
                job.id,
                JobStatus::Failed,
                JobPatch {
                    finished_at: Some(Utc::now()),
                    error_message: Some(message.clone()),
                    ..Default::default()
                },
            )
            .await?;

        Ok(JobOutcome::Failed(message))
    }
}
