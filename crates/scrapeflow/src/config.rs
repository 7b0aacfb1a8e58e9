use std::path::PathBuf;
use std::time::Duration;

use crate::jobs::queue::QueueConfig;
use crate::jobs::retry::RetryConfig;
use crate::scrape::worker::WorkerConfig;

/// Runtime configuration, read from the environment (and `.env` when present).
///
/// Every knob accepts a `SCRAPEFLOW_*` name; the common ones also accept the
/// short legacy name as a fallback.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub recovery_batch_size: i64,
    pub data_dir: PathBuf,
    pub rate_limiting: bool,
    pub default_headless: bool,
    pub page_timeout_ms: u64,
    pub api_addr: Option<String>,
    /// Accepted `X-API-Key` values. Empty leaves the API open.
    pub api_keys: Vec<String>,
    pub migrate_on_startup: bool,
    pub webhook_timeout_secs: u64,
    pub log_json: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let concurrency = env_or_fallback("SCRAPEFLOW_CONCURRENCY", "QUEUE_CONCURRENCY")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(3)
            .clamp(1, 64);

        let poll_interval_ms = env_or_fallback("SCRAPEFLOW_POLL_INTERVAL_MS", "POLL_INTERVAL_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000)
            .max(100);

        let recovery_batch_size = env_parse("SCRAPEFLOW_RECOVERY_BATCH")
            .unwrap_or(10_i64)
            .clamp(1, 1000);

        let data_dir = env_or_fallback("SCRAPEFLOW_DATA_DIR", "DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data"));

        let rate_limiting = env_or_fallback("SCRAPEFLOW_RATE_LIMITING", "ENABLE_RATE_LIMITING")
            .map(|v| parse_bool(&v))
            .unwrap_or(true);

        let default_headless = env_bool("SCRAPEFLOW_HEADLESS").unwrap_or(true);

        let page_timeout_ms = env_parse("SCRAPEFLOW_PAGE_TIMEOUT_MS").unwrap_or(30_000);

        let api_addr = match env_or_fallback("SCRAPEFLOW_API_ADDR", "API_ADDR") {
            Some(v) => normalize_optional_addr(&v),
            None => Some("0.0.0.0:3000".to_string()),
        };

        let api_keys = env_or_fallback("SCRAPEFLOW_API_KEYS", "API_KEYS")
            .map(|v| parse_api_keys(&v))
            .unwrap_or_default();

        let migrate_on_startup = env_bool("SCRAPEFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);

        let webhook_timeout_secs = env_parse("SCRAPEFLOW_WEBHOOK_TIMEOUT_SECS")
            .unwrap_or(10_u64)
            .clamp(1, 120);

        let log_json = std::env::var("LOG_FORMAT")
            .map(|v| v.trim().eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Ok(Self {
            database_url,
            concurrency,
            poll_interval_ms,
            recovery_batch_size,
            data_dir,
            rate_limiting,
            default_headless,
            page_timeout_ms,
            api_addr,
            api_keys,
            migrate_on_startup,
            webhook_timeout_secs,
            log_json,
        })
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            concurrency: self.concurrency,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            recovery_batch_size: self.recovery_batch_size,
            ..QueueConfig::default()
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            page_timeout: Duration::from_millis(self.page_timeout_ms),
            data_dir: self.data_dir.clone(),
            rate_limiting: self.rate_limiting,
            navigation_retry: RetryConfig::navigation(),
        }
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| parse_bool(&v))
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_api_keys(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
