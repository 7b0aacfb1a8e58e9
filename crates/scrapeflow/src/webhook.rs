//! Best-effort HTTP callbacks for terminal job events.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::jobs::events::{JobSummary, QueueEvent};
use crate::jobs::model::{JobStatus, QueueJob};
use crate::scrape::item::ScrapedItem;

/// Upper bound on items echoed back in a completion payload.
pub const VENUE_PREVIEW_LIMIT: usize = 100;

pub const USER_AGENT: &str = concat!("scrapeflow/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("webhook endpoint answered {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub site: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<WebhookData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WebhookErrorBody>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookData {
    pub count: usize,
    pub items_extracted: u32,
    pub pages_scraped: u32,
    pub duration_ms: i64,
    pub result_file_path: String,
    pub venues: Vec<VenuePreview>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookErrorBody {
    pub message: String,
}

/// Fixed-shape projection of a scraped item for automation tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenuePreview {
    pub name: String,
    pub location: String,
    /// Numeric rating, or `"New"` for unrated items.
    pub rating: Value,
    pub reviews: Value,
    pub price: String,
    pub url: String,
}

impl VenuePreview {
    pub fn from_item(item: &ScrapedItem) -> Self {
        let text = |key: &str| item.get_str(key).unwrap_or_default().to_string();
        Self {
            name: text("name"),
            location: text("location"),
            rating: item
                .get("rating")
                .cloned()
                .unwrap_or_else(|| Value::String("New".into())),
            reviews: item.get("reviews").cloned().unwrap_or_else(|| Value::from(0)),
            price: text("price"),
            url: text("url"),
        }
    }
}

pub fn completed_payload(job: &QueueJob, summary: &JobSummary) -> WebhookPayload {
    WebhookPayload {
        job_id: job.id,
        status: JobStatus::Completed,
        site: job.site.clone(),
        timestamp: Utc::now(),
        data: Some(WebhookData {
            count: summary.items.len(),
            items_extracted: summary.items_extracted,
            pages_scraped: summary.pages_scraped,
            duration_ms: summary.duration_ms,
            result_file_path: summary.result_file_path.clone(),
            venues: summary
                .items
                .iter()
                .take(VENUE_PREVIEW_LIMIT)
                .map(VenuePreview::from_item)
                .collect(),
        }),
        error: None,
    }
}

pub fn failed_payload(job: &QueueJob, message: &str) -> WebhookPayload {
    WebhookPayload {
        job_id: job.id,
        status: JobStatus::Failed,
        site: job.site.clone(),
        timestamp: Utc::now(),
        data: None,
        error: Some(WebhookErrorBody {
            message: message.to_string(),
        }),
    }
}

/// Target URL and payload for an event, if it warrants a callback.
pub fn delivery_for(event: &QueueEvent) -> Option<(String, WebhookPayload)> {
    let (job, payload) = match event {
        QueueEvent::JobCompleted { job, summary } => (job, completed_payload(job, summary)),
        QueueEvent::JobFailed { job, error } => (job, failed_payload(job, error)),
        _ => return None,
    };
    let url = job.webhook_url.as_deref()?.trim();
    if url.is_empty() {
        return None;
    }
    Some((url.to_string(), payload))
}

#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }

    /// Single POST attempt. Any non-2xx answer is an error.
    pub async fn send(&self, url: &str, payload: &WebhookPayload) -> Result<(), WebhookError> {
        let response = self.client.post(url).json(payload).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WebhookError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    /// Delivers callbacks for terminal events until the feed closes. Takes
    /// [`crate::jobs::JobQueue::terminal_events`], which never drops events.
    /// Delivery failures are logged and never touch job state.
    pub fn spawn(self, mut rx: mpsc::UnboundedReceiver<QueueEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some((url, payload)) = delivery_for(&event) else {
                    continue;
                };

                let notifier = self.clone();
                tokio::spawn(async move {
                    match notifier.send(&url, &payload).await {
                        Ok(()) => tracing::info!(
                            job_id = %payload.job_id,
                            status = payload.status.as_str(),
                            "webhook delivered"
                        ),
                        Err(e) => tracing::warn!(
                            job_id = %payload.job_id,
                            url = %url,
                            error = %e,
                            "webhook delivery failed"
                        ),
                    }
                });
            }
        })
    }
}
