use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::jobs::retry::RateLimit;
use crate::scrape::browser::{BrowserError, PageController};
use crate::scrape::item::ScrapedItem;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error(transparent)]
    Browser(#[from] BrowserError),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// `go_to_next_page` called without a next-page control. Contract violation.
    #[error("no next page control found")]
    NoNextPage,

    #[error("extraction failed: {0}")]
    Extraction(String),
}

/// Site-specific scraping surface, one implementation per target site.
#[async_trait]
pub trait SiteAdapter: Send + Sync {
    fn build_url(&self, parameters: &Value) -> Result<String, AdapterError>;

    /// Best-effort page count. Never fails; returns at least 1.
    async fn total_pages(&self, page: &dyn PageController) -> u32;

    /// Items on the current listing page, without entries missing their
    /// identity fields. An empty page is `Ok(vec![])`.
    async fn extract_data(&self, page: &dyn PageController)
        -> Result<Vec<ScrapedItem>, AdapterError>;

    async fn has_next_page(&self, page: &dyn PageController) -> Result<bool, AdapterError>;

    async fn go_to_next_page(&self, page: &dyn PageController) -> Result<(), AdapterError>;

    /// Detail fields for the item page the caller already navigated to.
    /// Absent fields are left out rather than reported as errors.
    async fn extract_detailed_data(
        &self,
        page: &dyn PageController,
        item_url: &str,
    ) -> Result<ScrapedItem, AdapterError>;

    fn rate_limit(&self) -> RateLimit {
        RateLimit::new(1000, 2000)
    }

    fn detail_rate_limit(&self) -> RateLimit {
        RateLimit::new(2000, 4000)
    }
}

/// Site key → adapter lookup.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn SiteAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, site: &str, adapter: Arc<dyn SiteAdapter>) {
        self.adapters.insert(site.to_string(), adapter);
    }

    pub fn with(mut self, site: &str, adapter: Arc<dyn SiteAdapter>) -> Self {
        self.register(site, adapter);
        self
    }

    pub fn adapter_for(&self, site: &str) -> Option<Arc<dyn SiteAdapter>> {
        self.adapters.get(site).cloned()
    }

    pub fn contains(&self, site: &str) -> bool {
        self.adapters.contains_key(site)
    }

    pub fn sites(&self) -> Vec<String> {
        let mut sites: Vec<String> = self.adapters.keys().cloned().collect();
        sites.sort();
        sites
    }
}
