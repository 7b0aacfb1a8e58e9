//! In-process stand-ins for the browser and a site, used by worker and queue tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::jobs::retry::RateLimit;
use crate::scrape::adapter::{AdapterError, SiteAdapter};
use crate::scrape::browser::{
    BrowserError, BrowserLauncher, BrowserResult, BrowserSession, PageController,
};
use crate::scrape::item::ScrapedItem;

const LISTING: &str = "https://fake.test/list?page=";

#[derive(Default)]
struct BrowserState {
    visits: Mutex<Vec<String>>,
    /// url -> remaining failures before `goto` succeeds
    flaky: Mutex<HashMap<String, u32>>,
}

#[derive(Default)]
pub struct FakeLauncher {
    state: Arc<BrowserState>,
    launched: Mutex<Vec<(bool, Arc<AtomicBool>)>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// First `failures` navigations to `url` fail with a connection reset.
    pub fn flaky_url(self, url: &str, failures: u32) -> Self {
        self.state
            .flaky
            .lock()
            .unwrap()
            .insert(url.to_string(), failures);
        self
    }

    pub fn launches(&self) -> Vec<bool> {
        self.launched.lock().unwrap().iter().map(|(h, _)| *h).collect()
    }

    pub fn is_closed(&self, index: usize) -> bool {
        self.launched.lock().unwrap()[index].1.load(Ordering::SeqCst)
    }

    pub fn visits_to(&self, url: &str) -> usize {
        self.state
            .visits
            .lock()
            .unwrap()
            .iter()
            .filter(|v| v.as_str() == url)
            .count()
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self, headless: bool) -> BrowserResult<Arc<dyn BrowserSession>> {
        let closed = Arc::new(AtomicBool::new(false));
        self.launched.lock().unwrap().push((headless, closed.clone()));
        Ok(Arc::new(FakeSession {
            state: self.state.clone(),
            closed,
        }))
    }
}

struct FakeSession {
    state: Arc<BrowserState>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn new_page(&self, _timeout: Duration) -> BrowserResult<Box<dyn PageController>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrowserError::Closed);
        }
        Ok(Box::new(FakePage {
            state: self.state.clone(),
            url: Mutex::new(None),
        }))
    }

    async fn close(&self) -> BrowserResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct FakePage {
    state: Arc<BrowserState>,
    url: Mutex<Option<String>>,
}

impl FakePage {
    fn listing_page(&self) -> u32 {
        self.url
            .lock()
            .unwrap()
            .as_deref()
            .and_then(|u| u.strip_prefix(LISTING))
            .and_then(|n| n.parse().ok())
            .unwrap_or(1)
    }
}

#[async_trait]
impl PageController for FakePage {
    async fn goto(&self, url: &str) -> BrowserResult<()> {
        self.state.visits.lock().unwrap().push(url.to_string());

        if let Some(left) = self.state.flaky.lock().unwrap().get_mut(url) {
            if *left > 0 {
                *left -= 1;
                return Err(BrowserError::Navigation {
                    url: url.to_string(),
                    message: "net::ERR_CONNECTION_RESET".into(),
                });
            }
        }

        *self.url.lock().unwrap() = Some(url.to_string());
        Ok(())
    }

    async fn current_url(&self) -> BrowserResult<Option<String>> {
        Ok(self.url.lock().unwrap().clone())
    }

    async fn evaluate(&self, _script: &str) -> BrowserResult<Value> {
        Ok(json!(self.listing_page()))
    }

    async fn query_texts(&self, _selector: &str) -> BrowserResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn query_attributes(
        &self,
        _selector: &str,
        _attribute: &str,
    ) -> BrowserResult<Vec<Option<String>>> {
        Ok(Vec::new())
    }

    async fn exists(&self, _selector: &str) -> BrowserResult<bool> {
        Ok(false)
    }

    async fn click(&self, selector: &str) -> BrowserResult<()> {
        Err(BrowserError::SelectorNotFound(selector.to_string()))
    }

    async fn wait_for(&self, _selector: &str, _timeout: Duration) -> BrowserResult<bool> {
        Ok(true)
    }

    async fn screenshot(&self, _full_page: bool) -> BrowserResult<Vec<u8>> {
        Ok(b"\x89PNG fake".to_vec())
    }

    async fn close(&self) -> BrowserResult<()> {
        Ok(())
    }
}

/// Paginated listing of `items_per_page` items per page. The pager exposes
/// `real_pages` pages while `total_pages` reports `reported_pages`.
pub struct FakeAdapter {
    reported_pages: u32,
    real_pages: u32,
    items_per_page: usize,
    failing_details: HashSet<String>,
    rate: RateLimit,
    delay: Duration,
}

impl FakeAdapter {
    pub fn new(pages: u32, items_per_page: usize) -> Self {
        Self {
            reported_pages: pages,
            real_pages: pages,
            items_per_page,
            failing_details: HashSet::new(),
            rate: RateLimit::new(0, 0),
            delay: Duration::ZERO,
        }
    }

    pub fn with_real_pages(mut self, pages: u32) -> Self {
        self.real_pages = pages;
        self
    }

    pub fn failing_details_for(mut self, url: &str) -> Self {
        self.failing_details.insert(url.to_string());
        self
    }

    pub fn with_rate_limit(mut self, rate: RateLimit) -> Self {
        self.rate = rate;
        self
    }

    /// Extraction takes this long per page, keeping jobs active for a while.
    pub fn with_extract_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    async fn current(&self, page: &dyn PageController) -> Result<u32, AdapterError> {
        let n = page.evaluate("page").await?;
        n.as_u64()
            .map(|n| n as u32)
            .ok_or_else(|| AdapterError::Extraction("no page number".into()))
    }
}

#[async_trait]
impl SiteAdapter for FakeAdapter {
    fn build_url(&self, parameters: &Value) -> Result<String, AdapterError> {
        if parameters.get("broken").is_some() {
            return Err(AdapterError::InvalidParameters("broken".into()));
        }
        Ok(format!("{LISTING}1"))
    }

    async fn total_pages(&self, _page: &dyn PageController) -> u32 {
        self.reported_pages.max(1)
    }

    async fn extract_data(
        &self,
        page: &dyn PageController,
    ) -> Result<Vec<ScrapedItem>, AdapterError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let n = self.current(page).await?;
        Ok((0..self.items_per_page)
            .map(|i| {
                ScrapedItem::new()
                    .with("name", format!("Item {n}-{i}"))
                    .with("url", format!("https://fake.test/item/{n}-{i}"))
            })
            .collect())
    }

    async fn has_next_page(&self, page: &dyn PageController) -> Result<bool, AdapterError> {
        Ok(self.current(page).await? < self.real_pages)
    }

    async fn go_to_next_page(&self, page: &dyn PageController) -> Result<(), AdapterError> {
        let n = self.current(page).await?;
        if n >= self.real_pages {
            return Err(AdapterError::NoNextPage);
        }
        page.goto(&format!("{LISTING}{}", n + 1)).await?;
        Ok(())
    }

    async fn extract_detailed_data(
        &self,
        _page: &dyn PageController,
        item_url: &str,
    ) -> Result<ScrapedItem, AdapterError> {
        if self.failing_details.contains(item_url) {
            return Err(AdapterError::Extraction("detail layout not recognised".into()));
        }
        let tail = item_url.rsplit('/').next().unwrap_or_default();
        Ok(ScrapedItem::new()
            .with("phone", format!("555-{tail}"))
            .with("website", format!("{item_url}/site")))
    }

    fn rate_limit(&self) -> RateLimit {
        self.rate
    }

    fn detail_rate_limit(&self) -> RateLimit {
        self.rate
    }
}
