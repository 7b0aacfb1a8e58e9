//! Chromium backend for the page-controller traits, over the DevTools protocol.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use scrapeflow::scrape::browser::{
    BrowserError, BrowserLauncher, BrowserResult, BrowserSession, PageController,
};

const WAIT_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Default)]
pub struct ChromiumLauncher {
    /// Needed when running as root inside containers.
    pub no_sandbox: bool,
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self, headless: bool) -> BrowserResult<Arc<dyn BrowserSession>> {
        let mut builder = BrowserConfig::builder();
        if !headless {
            builder = builder.with_head();
        }
        if self.no_sandbox {
            builder = builder.no_sandbox();
        }
        let config = builder.build().map_err(BrowserError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BrowserError::Launch(e.to_string()))?;

        // The CDP handler must be polled for the browser to make progress.
        let events = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::debug!(error = %e, "chromium handler stopped");
                    break;
                }
            }
        });

        tracing::info!(headless, "chromium launched");
        Ok(Arc::new(ChromiumSession {
            browser: Mutex::new(browser),
            events,
        }))
    }
}

pub struct ChromiumSession {
    browser: Mutex<Browser>,
    events: JoinHandle<()>,
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn new_page(&self, default_timeout: Duration) -> BrowserResult<Box<dyn PageController>> {
        let page = self
            .browser
            .lock()
            .await
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::Other(format!("failed to open page: {e}")))?;

        Ok(Box::new(ChromiumPage {
            page,
            timeout: default_timeout,
        }))
    }

    async fn close(&self) -> BrowserResult<()> {
        let mut browser = self.browser.lock().await;
        let closed = browser.close().await;
        let _ = browser.wait().await;
        self.events.abort();
        closed
            .map(|_| ())
            .map_err(|e| BrowserError::Other(format!("failed to close browser: {e}")))
    }
}

pub struct ChromiumPage {
    page: Page,
    timeout: Duration,
}

impl ChromiumPage {
    async fn bounded<T, F>(&self, what: &str, fut: F) -> BrowserResult<T>
    where
        F: Future<Output = BrowserResult<T>>,
    {
        within(self.timeout, what, fut).await
    }
}

/// Every CDP round trip goes through here; a hung call surfaces as `Timeout`.
async fn within<T, F>(timeout: Duration, what: &str, fut: F) -> BrowserResult<T>
where
    F: Future<Output = BrowserResult<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| BrowserError::Timeout(timeout, what.to_string()))?
}

fn other(e: impl std::fmt::Display) -> BrowserError {
    BrowserError::Other(e.to_string())
}

#[async_trait]
impl PageController for ChromiumPage {
    async fn goto(&self, url: &str) -> BrowserResult<()> {
        self.bounded(url, async {
            self.page
                .goto(url)
                .await
                .map(|_| ())
                .map_err(|e| BrowserError::Navigation {
                    url: url.to_string(),
                    message: e.to_string(),
                })
        })
        .await
    }

    async fn current_url(&self) -> BrowserResult<Option<String>> {
        self.bounded("current url", async { self.page.url().await.map_err(other) })
            .await
    }

    async fn evaluate(&self, script: &str) -> BrowserResult<Value> {
        self.bounded("script", async {
            let result = self
                .page
                .evaluate(script)
                .await
                .map_err(|e| BrowserError::Script(e.to_string()))?;
            Ok(result.value().cloned().unwrap_or(Value::Null))
        })
        .await
    }

    async fn query_texts(&self, selector: &str) -> BrowserResult<Vec<String>> {
        self.bounded(selector, async {
            let elements = self.page.find_elements(selector).await.map_err(other)?;
            let mut texts = Vec::with_capacity(elements.len());
            for element in elements {
                if let Some(text) = element.inner_text().await.map_err(other)? {
                    texts.push(text.trim().to_string());
                }
            }
            Ok(texts)
        })
        .await
    }

    async fn query_attributes(
        &self,
        selector: &str,
        attribute: &str,
    ) -> BrowserResult<Vec<Option<String>>> {
        self.bounded(selector, async {
            let elements = self.page.find_elements(selector).await.map_err(other)?;
            let mut values = Vec::with_capacity(elements.len());
            for element in elements {
                values.push(element.attribute(attribute).await.map_err(other)?);
            }
            Ok(values)
        })
        .await
    }

    async fn exists(&self, selector: &str) -> BrowserResult<bool> {
        self.bounded(selector, async {
            let found = self.page.find_elements(selector).await.map_err(other)?;
            Ok(!found.is_empty())
        })
        .await
    }

    async fn click(&self, selector: &str) -> BrowserResult<()> {
        self.bounded(selector, async {
            let element = self
                .page
                .find_element(selector)
                .await
                .map_err(|_| BrowserError::SelectorNotFound(selector.to_string()))?;
            element.click().await.map(|_| ()).map_err(other)
        })
        .await
    }

    async fn wait_for(&self, selector: &str, timeout: Duration) -> BrowserResult<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.exists(selector).await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    async fn screenshot(&self, full_page: bool) -> BrowserResult<Vec<u8>> {
        let params = ScreenshotParams::builder().full_page(full_page).build();
        self.bounded("screenshot", async {
            self.page
                .screenshot(params)
                .await
                .map_err(|e| BrowserError::Screenshot(e.to_string()))
        })
        .await
    }

    async fn close(&self) -> BrowserResult<()> {
        self.bounded("close page", async { self.page.clone().close().await.map_err(other) })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn hung_call_times_out() {
        let res: BrowserResult<Vec<u8>> = within(
            Duration::from_secs(30),
            "screenshot",
            std::future::pending(),
        )
        .await;

        match res {
            Err(BrowserError::Timeout(after, what)) => {
                assert_eq!(after, Duration::from_secs(30));
                assert_eq!(what, "screenshot");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn finished_call_passes_through() {
        let res = within(Duration::from_secs(1), "current url", async {
            Ok::<_, BrowserError>(Some("https://example.com".to_string()))
        })
        .await
        .unwrap();
        assert_eq!(res.as_deref(), Some("https://example.com"));
    }
}
