use std::sync::Arc;

use crate::jobs::model::QueueJob;
use crate::scrape::item::ScrapedItem;

/// Result summary of a completed job.
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub pages_scraped: u32,
    pub items_extracted: u32,
    pub duration_ms: i64,
    pub result_file_path: String,
    pub items: Arc<Vec<ScrapedItem>>,
}

/// Lifecycle signals published by the queue.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    JobQueued(QueueJob),
    JobStarted(QueueJob),
    JobCompleted { job: QueueJob, summary: JobSummary },
    JobFailed { job: QueueJob, error: String },
    QueuePaused,
    QueueResumed,
}

impl QueueEvent {
    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::JobQueued(_) => "job-queued",
            QueueEvent::JobStarted(_) => "job-started",
            QueueEvent::JobCompleted { .. } => "job-completed",
            QueueEvent::JobFailed { .. } => "job-failed",
            QueueEvent::QueuePaused => "queue-paused",
            QueueEvent::QueueResumed => "queue-resumed",
        }
    }

    pub fn job(&self) -> Option<&QueueJob> {
        match self {
            QueueEvent::JobQueued(job) | QueueEvent::JobStarted(job) => Some(job),
            QueueEvent::JobCompleted { job, .. } | QueueEvent::JobFailed { job, .. } => Some(job),
            QueueEvent::QueuePaused | QueueEvent::QueueResumed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueEvent::JobCompleted { .. } | QueueEvent::JobFailed { .. }
        )
    }
}

/// Traces every event until the channel closes.
pub fn spawn_event_logger(
    mut rx: tokio::sync::broadcast::Receiver<QueueEvent>,
) -> tokio::task::JoinHandle<()> {
    use tokio::sync::broadcast::error::RecvError;

    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match &event {
                    QueueEvent::JobCompleted { job, summary } => tracing::info!(
                        job_id = %job.id,
                        site = %job.site,
                        pages_scraped = summary.pages_scraped,
                        items_extracted = summary.items_extracted,
                        duration_ms = summary.duration_ms,
                        "job completed"
                    ),
                    QueueEvent::JobFailed { job, error } => tracing::warn!(
                        job_id = %job.id,
                        site = %job.site,
                        error = %error,
                        "job failed"
                    ),
                    other => match other.job() {
                        Some(job) => tracing::debug!(job_id = %job.id, event = other.name(), "queue event"),
                        None => tracing::info!(event = other.name(), "queue event"),
                    },
                },
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "event logger lagged behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
