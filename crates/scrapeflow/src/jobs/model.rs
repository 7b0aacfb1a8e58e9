use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub site: String,
    pub job_type: JobType,
    pub parameters: Value,
    pub format: OutputFormat,
    pub headless: bool,
    pub webhook_url: Option<String>,

    pub status: JobStatus,
    pub pages_scraped: i32,
    pub items_extracted: i32,

    pub result_file_path: Option<String>,
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl Job {
    /// Dispatch projection used by the in-memory queue.
    pub fn to_queue_job(&self) -> QueueJob {
        QueueJob {
            id: self.id,
            site: self.site.clone(),
            parameters: self.parameters.clone(),
            format: self.format,
            headless: self.headless,
            job_type: self.job_type,
            webhook_url: self.webhook_url.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub site: String,
    pub job_type: JobType,
    pub parameters: Value,
    pub format: OutputFormat,
    pub headless: bool,
    pub webhook_url: Option<String>,
}

/// Lightweight copy of a job held by the queue. The store record stays authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: Uuid,
    pub site: String,
    pub parameters: Value,
    pub format: OutputFormat,
    pub headless: bool,
    pub job_type: JobType,
    pub webhook_url: Option<String>,
}

/// Partial update applied together with a status write. `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub pages_scraped: Option<i32>,
    pub items_extracted: Option<i32>,
    pub result_file_path: Option<String>,
    pub error_message: Option<String>,
}

impl JobPatch {
    pub fn progress(pages_scraped: Option<i32>, items_extracted: i32) -> Self {
        Self {
            pages_scraped,
            items_extracted: Some(items_extracted),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    #[default]
    Scrape,
    Enrich,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Scrape => "scrape",
            JobType::Enrich => "enrich",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Csv,
    Json,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Json => "json",
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    /// The format written alongside the requested one.
    pub fn other(&self) -> Self {
        match self {
            OutputFormat::Csv => OutputFormat::Json,
            OutputFormat::Json => OutputFormat::Csv,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind}: {value:?}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl FromStr for JobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(ParseEnumError {
                kind: "job status",
                value: s.to_string(),
            }),
        }
    }
}

impl FromStr for JobType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "scrape" => Ok(Self::Scrape),
            "enrich" => Ok(Self::Enrich),
            _ => Err(ParseEnumError {
                kind: "job type",
                value: s.to_string(),
            }),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            _ => Err(ParseEnumError {
                kind: "output format",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(ParseEnumError {
                kind: "log level",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobLog {
    pub id: i64,
    pub job_id: Uuid,
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Screenshot {
    pub id: i64,
    pub job_id: Uuid,
    pub file_path: String,
    pub context: String,
    pub created_at: DateTime<Utc>,
}
