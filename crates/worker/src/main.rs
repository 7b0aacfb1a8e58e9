use std::sync::Arc;

use scrapeflow::api;
use scrapeflow::config;
use scrapeflow::db;
use scrapeflow::jobs::events::spawn_event_logger;
use scrapeflow::jobs::{JobQueue, JobRunner, JobStore, JobsRepo};
use scrapeflow::observability;
use scrapeflow::scrape::export::ResultWriter;
use scrapeflow::scrape::{BrowserLauncher, JobWorker};
use scrapeflow::webhook::WebhookNotifier;

#[cfg(feature = "chromium")]
mod chromium;
mod sites;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::from_env()?;
    observability::init_tracing(cfg.log_json);

    tracing::info!(
        concurrency = cfg.concurrency,
        poll_interval_ms = cfg.poll_interval_ms,
        recovery_batch_size = cfg.recovery_batch_size,
        data_dir = %cfg.data_dir.display(),
        rate_limiting = cfg.rate_limiting,
        default_headless = cfg.default_headless,
        api = cfg.api_addr.as_deref().unwrap_or("disabled"),
        api_keys = cfg.api_keys.len(),
        migrate_on_startup = cfg.migrate_on_startup,
        "scrapeflow starting"
    );

    let pool = db::make_pool(&cfg.database_url).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let store: Arc<dyn JobStore> = Arc::new(JobsRepo::new(pool));
    let adapters = sites::build_registry();
    tracing::info!(sites = ?adapters.sites(), "site adapters registered");

    let worker = JobWorker::new(
        store.clone(),
        adapters.clone(),
        launcher(),
        cfg.worker_config(),
    );
    let runner = JobRunner::new(store.clone(), Arc::new(worker));
    let queue = JobQueue::new(cfg.queue_config(), store.clone(), runner);

    let logger = spawn_event_logger(queue.subscribe());
    let notifier = WebhookNotifier::new(cfg.webhook_timeout())?.spawn(queue.terminal_events());

    queue.start();

    // ---- API task ----
    let app = api::router(api::ApiState {
        store: store.clone(),
        queue: queue.clone(),
        adapters,
        results: ResultWriter::new(cfg.data_dir.clone()),
        default_headless: cfg.default_headless,
        api_keys: Arc::new(cfg.api_keys.clone()),
    });
    if cfg.api_keys.is_empty() {
        tracing::warn!("API_KEYS is not set, the api accepts unauthenticated requests");
    }
    let api_addr = cfg.api_addr.clone();
    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!(%addr, "api listening");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    let result = tokio::select! {
        res = api_handle => res.map_err(anyhow::Error::from).and_then(|r| r),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested, draining active jobs");
            Ok(())
        }
    };

    queue.stop().await;
    logger.abort();
    notifier.abort();
    tracing::info!("scrapeflow stopped");

    result
}

#[cfg(feature = "chromium")]
fn launcher() -> Arc<dyn BrowserLauncher> {
    let no_sandbox = std::env::var("SCRAPEFLOW_CHROME_NO_SANDBOX")
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(false);
    Arc::new(chromium::ChromiumLauncher { no_sandbox })
}

#[cfg(not(feature = "chromium"))]
fn launcher() -> Arc<dyn BrowserLauncher> {
    use scrapeflow::scrape::browser::{BrowserError, BrowserResult, BrowserSession};

    struct Unavailable;

    #[async_trait::async_trait]
    impl BrowserLauncher for Unavailable {
        async fn launch(&self, _headless: bool) -> BrowserResult<Arc<dyn BrowserSession>> {
            Err(BrowserError::Launch(
                "scrapeflow-worker was built without the `chromium` feature".into(),
            ))
        }
    }

    Arc::new(Unavailable)
}
