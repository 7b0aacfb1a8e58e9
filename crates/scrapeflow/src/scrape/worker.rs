//! Executes one queued job against a browser session and a site adapter.
//!
//! Scrape jobs walk listing pages until the page budget or the last page is
//! reached. Enrich jobs visit a list of item URLs and merge the detail fields
//! into previously-known data. Both checkpoint progress through the store
//! and write `{id}.csv` + `{id}.json` on success.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::jobs::model::{JobPatch, JobStatus, JobType, LogLevel, QueueJob};
use crate::jobs::retry::{random_delay, retry_with_backoff_if, RateLimit, RetryConfig, RetryError};
use crate::jobs::runner::JobExecutor;
use crate::jobs::store::JobStore;
use crate::scrape::adapter::{AdapterError, AdapterRegistry, SiteAdapter};
use crate::scrape::browser::{BrowserError, BrowserLauncher, BrowserSession, PageController};
use crate::scrape::export::{ExportError, ResultWriter};
use crate::scrape::item::{ScrapedItem, ENRICHMENT_ERROR_KEY};
use crate::scrape::params::{EnrichParams, PageBudget, ParamError};

#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    #[error("unknown site: {0}")]
    UnknownSite(String),

    #[error(transparent)]
    Params(#[from] ParamError),

    #[error(transparent)]
    Navigation(#[from] RetryError<BrowserError>),

    #[error(transparent)]
    Browser(#[from] BrowserError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),

    #[error("job task panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Default operation timeout applied to every page.
    pub page_timeout: Duration,
    pub data_dir: PathBuf,
    /// Off in test runs; adapters' delay windows are ignored entirely.
    pub rate_limiting: bool,
    pub navigation_retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            page_timeout: Duration::from_millis(30_000),
            data_dir: PathBuf::from("data"),
            rate_limiting: true,
            navigation_retry: RetryConfig::navigation(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub items: Vec<ScrapedItem>,
    pub pages_scraped: u32,
    pub items_extracted: u32,
    pub result_file_path: PathBuf,
}

#[derive(Default)]
struct SessionSlot {
    current: Option<(bool, Arc<dyn BrowserSession>)>,
    /// Sessions replaced after a headless-mode change, closed once no job holds them.
    retired: Vec<Arc<dyn BrowserSession>>,
}

pub struct JobWorker {
    store: Arc<dyn JobStore>,
    adapters: AdapterRegistry,
    launcher: Arc<dyn BrowserLauncher>,
    writer: ResultWriter,
    config: WorkerConfig,
    session: Mutex<SessionSlot>,
}

impl JobWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        adapters: AdapterRegistry,
        launcher: Arc<dyn BrowserLauncher>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            adapters,
            launcher,
            writer: ResultWriter::new(config.data_dir.clone()),
            config,
            session: Mutex::new(SessionSlot::default()),
        }
    }

    async fn acquire_session(
        &self,
        job_id: Uuid,
        headless: bool,
    ) -> Result<Arc<dyn BrowserSession>, ScrapeError> {
        let mut slot = self.session.lock().await;

        if let Some((mode, session)) = &slot.current {
            if *mode == headless {
                return Ok(session.clone());
            }
        }

        if let Some((mode, old)) = slot.current.take() {
            self.log(
                job_id,
                LogLevel::Info,
                &format!("Headless mode changed ({mode} -> {headless}), recreating browser"),
            )
            .await;
            slot.retired.push(old);
        }

        self.log(
            job_id,
            LogLevel::Info,
            &format!("Initializing browser (headless: {headless})"),
        )
        .await;
        let session = self.launcher.launch(headless).await?;
        slot.current = Some((headless, session.clone()));
        Ok(session)
    }

    async fn close_idle_retired(&self) {
        let idle: Vec<Arc<dyn BrowserSession>> = {
            let mut slot = self.session.lock().await;
            let (idle, busy) = std::mem::take(&mut slot.retired)
                .into_iter()
                .partition(|s| Arc::strong_count(s) == 1);
            slot.retired = busy;
            idle
        };

        for session in idle {
            if let Err(e) = session.close().await {
                tracing::warn!(error = %e, "failed to close retired browser session");
            }
        }
    }

    async fn run_on_page(
        &self,
        job: &QueueJob,
        adapter: &dyn SiteAdapter,
        session: &dyn BrowserSession,
    ) -> Result<WorkerResult, ScrapeError> {
        let page = session.new_page(self.config.page_timeout).await?;

        let outcome = match job.job_type {
            JobType::Scrape => self.scrape(job, adapter, page.as_ref()).await,
            JobType::Enrich => self.enrich(job, adapter, page.as_ref()).await,
        };

        if let Err(e) = &outcome {
            self.log(job.id, LogLevel::Error, &format!("Job failed: {e}"))
                .await;
            self.capture_error_screenshot(job.id, page.as_ref()).await;
        }

        if let Err(e) = page.close().await {
            tracing::debug!(job_id = %job.id, error = %e, "page close failed");
        }

        outcome
    }

    async fn scrape(
        &self,
        job: &QueueJob,
        adapter: &dyn SiteAdapter,
        page: &dyn PageController,
    ) -> Result<WorkerResult, ScrapeError> {
        let budget = PageBudget::from_parameters(&job.parameters)?;
        let url = adapter.build_url(&job.parameters)?;

        self.log(job.id, LogLevel::Info, &format!("Navigating to {url}"))
            .await;
        if let Err(e) = self.navigate(page, &url).await {
            self.log(
                job.id,
                LogLevel::Error,
                &format!("Failed to navigate after retries: {e}"),
            )
            .await;
            return Err(e.into());
        }

        let total_available = adapter.total_pages(page).await;
        let pages_to_scrape = budget.pages_to_scrape(total_available);
        self.log(
            job.id,
            LogLevel::Info,
            &format!(
                "Will scrape {pages_to_scrape} pages (requested: {budget}, available: {total_available})"
            ),
        )
        .await;

        let rate = adapter.rate_limit();
        self.log_rate_limiting(job.id, rate).await;

        let mut items: Vec<ScrapedItem> = Vec::new();
        let mut pages_scraped: u32 = 0;

        loop {
            self.log(
                job.id,
                LogLevel::Info,
                &format!("Scraping page {} of {pages_to_scrape}", pages_scraped + 1),
            )
            .await;

            items.extend(adapter.extract_data(page).await?);
            pages_scraped += 1;
            self.checkpoint(job.id, Some(pages_scraped), items.len())
                .await?;

            if pages_scraped >= pages_to_scrape {
                self.log(
                    job.id,
                    LogLevel::Info,
                    &format!("Reached target pages ({pages_to_scrape})"),
                )
                .await;
                break;
            }

            // Site totals are estimates; the pager is the source of truth.
            if !adapter.has_next_page(page).await? {
                self.log(job.id, LogLevel::Info, "No more pages available")
                    .await;
                break;
            }

            if self.config.rate_limiting {
                let waited = random_delay(rate.min, rate.max).await;
                self.log(
                    job.id,
                    LogLevel::Debug,
                    &format!("Waited {waited}ms before next page"),
                )
                .await;
            }

            adapter.go_to_next_page(page).await?;
        }

        self.log(job.id, LogLevel::Info, &format!("Saving {} items", items.len()))
            .await;
        let result_file_path = self.writer.write_both(job.id, &items, job.format).await?;

        Ok(WorkerResult {
            items_extracted: count(items.len()),
            items,
            pages_scraped,
            result_file_path,
        })
    }

    async fn enrich(
        &self,
        job: &QueueJob,
        adapter: &dyn SiteAdapter,
        page: &dyn PageController,
    ) -> Result<WorkerResult, ScrapeError> {
        let params = EnrichParams::from_parameters(&job.parameters)?;
        let known = params.known_by_url();
        let total = params.item_urls.len();

        self.log(job.id, LogLevel::Info, &format!("Enriching {total} items"))
            .await;
        let rate = adapter.detail_rate_limit();
        self.log_rate_limiting(job.id, rate).await;

        let mut items: Vec<ScrapedItem> = Vec::with_capacity(total);
        let mut enriched = 0usize;

        for (i, url) in params.item_urls.iter().enumerate() {
            self.log(
                job.id,
                LogLevel::Info,
                &format!("Enriching item {}/{total}: {url}", i + 1),
            )
            .await;

            let mut item = known.get(url).cloned().unwrap_or_default();
            match self.extract_details(adapter, page, url).await {
                Ok(details) => {
                    item.merge(details);
                    enriched += 1;
                }
                Err(e) => {
                    self.log(
                        job.id,
                        LogLevel::Warn,
                        &format!("Failed to enrich {url}: {e}"),
                    )
                    .await;
                    item.set(ENRICHMENT_ERROR_KEY, e.to_string());
                }
            }
            item.set("url", url.as_str());
            items.push(item);

            self.checkpoint(job.id, None, items.len()).await?;

            if self.config.rate_limiting && i + 1 < total {
                let waited = random_delay(rate.min, rate.max).await;
                self.log(
                    job.id,
                    LogLevel::Debug,
                    &format!("Waited {waited}ms before next item"),
                )
                .await;
            }
        }

        self.log(
            job.id,
            LogLevel::Info,
            &format!("Enrichment completed: {enriched}/{total} successful"),
        )
        .await;
        let result_file_path = self.writer.write_both(job.id, &items, job.format).await?;

        Ok(WorkerResult {
            items_extracted: count(items.len()),
            items,
            pages_scraped: 0,
            result_file_path,
        })
    }

    async fn extract_details(
        &self,
        adapter: &dyn SiteAdapter,
        page: &dyn PageController,
        url: &str,
    ) -> Result<ScrapedItem, ScrapeError> {
        self.navigate(page, url).await?;
        Ok(adapter.extract_detailed_data(page, url).await?)
    }

    async fn navigate(
        &self,
        page: &dyn PageController,
        url: &str,
    ) -> Result<(), RetryError<BrowserError>> {
        retry_with_backoff_if(
            &self.config.navigation_retry,
            || page.goto(url),
            BrowserError::is_retryable,
        )
        .await
    }

    async fn checkpoint(
        &self,
        job_id: Uuid,
        pages_scraped: Option<u32>,
        items_extracted: usize,
    ) -> Result<(), ScrapeError> {
        let patch = JobPatch::progress(
            pages_scraped.map(|p| i32::try_from(p).unwrap_or(i32::MAX)),
            i32::try_from(items_extracted).unwrap_or(i32::MAX),
        );
        self.store
            .update_job_status(job_id, JobStatus::Running, patch)
            .await?;
        Ok(())
    }

    async fn capture_error_screenshot(&self, job_id: Uuid, page: &dyn PageController) {
        let dir = self.writer.data_dir().join("screenshots");
        let path = dir.join(format!("{job_id}-error.png"));

        let captured = async {
            let png = page.screenshot(true).await?;
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(&path, png).await?;
            self.store
                .record_screenshot(job_id, &path.to_string_lossy(), "error")
                .await?;
            Ok::<(), anyhow::Error>(())
        }
        .await;

        if let Err(e) = captured {
            tracing::warn!(job_id = %job_id, error = %e, "failed to capture error screenshot");
        }
    }

    async fn log_rate_limiting(&self, job_id: Uuid, rate: RateLimit) {
        let message = if self.config.rate_limiting {
            format!("Rate limiting enabled: {}-{}ms delays", rate.min, rate.max)
        } else {
            "Rate limiting disabled".to_string()
        };
        self.log(job_id, LogLevel::Info, &message).await;
    }

    /// Traces the line and persists it as a job log. Persistence failures are only traced.
    async fn log(&self, job_id: Uuid, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(job_id = %job_id, "{message}"),
            LogLevel::Info => tracing::info!(job_id = %job_id, "{message}"),
            LogLevel::Warn => tracing::warn!(job_id = %job_id, "{message}"),
            LogLevel::Error => tracing::error!(job_id = %job_id, "{message}"),
        }

        if let Err(e) = self.store.append_log(job_id, level, message).await {
            tracing::warn!(job_id = %job_id, error = %e, "failed to persist job log");
        }
    }
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[async_trait]
impl JobExecutor for JobWorker {
    async fn execute(&self, job: &QueueJob) -> Result<WorkerResult, ScrapeError> {
        let adapter = self
            .adapters
            .adapter_for(&job.site)
            .ok_or_else(|| ScrapeError::UnknownSite(job.site.clone()))?;

        let session = self.acquire_session(job.id, job.headless).await?;
        let outcome = self.run_on_page(job, adapter.as_ref(), session.as_ref()).await;
        drop(session);

        self.close_idle_retired().await;
        outcome
    }

    async fn shutdown(&self) {
        let sessions: Vec<Arc<dyn BrowserSession>> = {
            let mut slot = self.session.lock().await;
            let mut all = std::mem::take(&mut slot.retired);
            all.extend(slot.current.take().map(|(_, s)| s));
            all
        };

        for session in sessions {
            if let Err(e) = session.close().await {
                tracing::warn!(error = %e, "failed to close browser session");
            }
        }
    }
}
