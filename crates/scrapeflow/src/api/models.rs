use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::jobs::model::{Job, JobLog, JobStatus, JobType, NewJob, OutputFormat, Screenshot};
use crate::scrape::adapter::AdapterRegistry;
use crate::scrape::params::EnrichParams;

/// Raw submission body. Fields are loose so every problem can be reported at once.
#[derive(Debug, Default, Deserialize)]
pub struct SubmitJobRequest {
    pub site: Option<Value>,
    pub parameters: Option<Value>,
    pub format: Option<Value>,
    pub webhook_url: Option<Value>,
    pub headless: Option<bool>,
    pub job_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EnrichJobRequest {
    pub site: Option<String>,
    #[serde(default, alias = "venueUrls")]
    pub item_urls: Vec<String>,
    #[serde(default, alias = "originalData")]
    pub known_items: Vec<Value>,
    pub format: Option<String>,
    pub webhook_url: Option<String>,
    pub headless: Option<bool>,
}

impl SubmitJobRequest {
    pub fn validate(
        self,
        adapters: &AdapterRegistry,
        default_headless: bool,
    ) -> Result<NewJob, Vec<String>> {
        let mut errors = Vec::new();

        let site = match self.site.as_ref().and_then(Value::as_str).map(str::trim) {
            Some(s) if !s.is_empty() => {
                if !adapters.contains(s) {
                    errors.push(format!("unknown site '{s}'"));
                }
                s.to_string()
            }
            _ => {
                errors.push("site is required and must be a string".to_string());
                String::new()
            }
        };

        let parameters = match self.parameters {
            Some(p @ Value::Object(_)) => p,
            _ => {
                errors.push("parameters is required and must be an object".to_string());
                Value::Null
            }
        };

        let format = parse_format(self.format.as_ref().and_then(Value::as_str), &mut errors);

        let webhook_url = match self.webhook_url {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => non_empty(s),
            Some(_) => {
                errors.push("webhook_url must be a string".to_string());
                None
            }
        };

        let job_type = match self.job_type.as_deref() {
            None | Some("") => JobType::Scrape,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                errors.push(format!("job_type must be 'scrape' or 'enrich', got '{raw}'"));
                JobType::Scrape
            }),
        };

        if job_type == JobType::Enrich && parameters.is_object() {
            if let Err(e) = EnrichParams::from_parameters(&parameters) {
                errors.push(e.to_string());
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(NewJob {
            site,
            job_type,
            parameters,
            format: format.unwrap_or(OutputFormat::Json),
            headless: self.headless.unwrap_or(default_headless),
            webhook_url,
        })
    }
}

impl EnrichJobRequest {
    pub fn validate(
        self,
        adapters: &AdapterRegistry,
        default_headless: bool,
    ) -> Result<NewJob, Vec<String>> {
        let mut errors = Vec::new();

        let site = self.site.map(|s| s.trim().to_string()).unwrap_or_default();
        if site.is_empty() {
            errors.push("site is required".to_string());
        } else if !adapters.contains(&site) {
            errors.push(format!("unknown site '{site}'"));
        }

        if self.item_urls.is_empty() {
            errors.push("item_urls must be a non-empty array".to_string());
        }

        let format = parse_format(self.format.as_deref(), &mut errors);

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(NewJob {
            site,
            job_type: JobType::Enrich,
            parameters: json!({
                "item_urls": self.item_urls,
                "known_items": self.known_items,
            }),
            format: format.unwrap_or(OutputFormat::Json),
            headless: self.headless.unwrap_or(default_headless),
            webhook_url: self.webhook_url.and_then(non_empty),
        })
    }
}

fn parse_format(raw: Option<&str>, errors: &mut Vec<String>) -> Option<OutputFormat> {
    match raw.map(str::parse::<OutputFormat>) {
        Some(Ok(format)) => Some(format),
        _ => {
            errors.push("format is required and must be 'csv' or 'json'".to_string());
            None
        }
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Progress {
    pub pages_scraped: i32,
    pub items_extracted: i32,
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub site: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub parameters: Value,
    pub format: OutputFormat,
    pub progress: Progress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            site: job.site,
            job_type: job.job_type,
            status: job.status,
            parameters: job.parameters,
            format: job.format,
            progress: Progress {
                pages_scraped: job.pages_scraped,
                items_extracted: job.items_extracted,
            },
            result_file_path: job.result_file_path,
            error_message: job.error_message,
            webhook_url: job.webhook_url,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            duration_ms: job.duration_ms,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobListItem {
    pub job_id: Uuid,
    pub site: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub format: OutputFormat,
    pub pages_scraped: i32,
    pub items_extracted: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl From<Job> for JobListItem {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            site: job.site,
            job_type: job.job_type,
            status: job.status,
            format: job.format,
            pages_scraped: job.pages_scraped,
            items_extracted: job.items_extracted,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            duration_ms: job.duration_ms,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobListItem>,
    pub total: usize,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub site: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct JobLogsResponse {
    pub job_id: Uuid,
    pub logs: Vec<JobLog>,
    pub screenshots: Vec<Screenshot>,
}

#[derive(Debug, Serialize)]
pub struct JobDataResponse {
    pub job_id: Uuid,
    pub format: OutputFormat,
    pub items_count: i32,
    pub data: Value,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Vec::new(),
        }
    }

    pub fn with_details(error: impl Into<String>, details: Vec<String>) -> Self {
        Self {
            error: error.into(),
            details,
        }
    }
}
