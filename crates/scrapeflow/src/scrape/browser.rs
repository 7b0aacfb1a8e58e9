//! Minimal page-controller surface the worker drives.
//!
//! The headless-browser engine lives behind these traits. A session is one
//! running browser process; each job opens its own page on it so concurrent
//! jobs never share navigation state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::jobs::retry::is_retryable_error;

#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("failed to launch browser: {0}")]
    Launch(String),

    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },

    #[error("timeout after {0:?} waiting for {1}")]
    Timeout(Duration, String),

    #[error("no element matches selector {0:?}")]
    SelectorNotFound(String),

    #[error("script evaluation failed: {0}")]
    Script(String),

    #[error("screenshot failed: {0}")]
    Screenshot(String),

    #[error("page or browser is closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

impl BrowserError {
    pub fn is_retryable(&self) -> bool {
        match self {
            BrowserError::Timeout(..) => true,
            BrowserError::SelectorNotFound(_) | BrowserError::Closed => false,
            other => is_retryable_error(&other.to_string()),
        }
    }
}

pub type BrowserResult<T> = Result<T, BrowserError>;

/// One tab/page. Implementations apply the default timeout given at
/// creation to every operation.
#[async_trait]
pub trait PageController: Send + Sync {
    async fn goto(&self, url: &str) -> BrowserResult<()>;

    async fn current_url(&self) -> BrowserResult<Option<String>>;

    /// Runs a script in the page and returns its JSON result.
    async fn evaluate(&self, script: &str) -> BrowserResult<Value>;

    /// Inner text of every element matching `selector`.
    async fn query_texts(&self, selector: &str) -> BrowserResult<Vec<String>>;

    /// `attribute` of every element matching `selector`.
    async fn query_attributes(
        &self,
        selector: &str,
        attribute: &str,
    ) -> BrowserResult<Vec<Option<String>>>;

    async fn exists(&self, selector: &str) -> BrowserResult<bool>;

    /// Clicks the first element matching `selector`.
    async fn click(&self, selector: &str) -> BrowserResult<()>;

    /// Waits until `selector` matches, returning `false` on timeout.
    async fn wait_for(&self, selector: &str, timeout: Duration) -> BrowserResult<bool>;

    async fn screenshot(&self, full_page: bool) -> BrowserResult<Vec<u8>>;

    async fn close(&self) -> BrowserResult<()>;
}

#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn new_page(&self, default_timeout: Duration) -> BrowserResult<Box<dyn PageController>>;

    async fn close(&self) -> BrowserResult<()>;
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, headless: bool) -> BrowserResult<Arc<dyn BrowserSession>>;
}
