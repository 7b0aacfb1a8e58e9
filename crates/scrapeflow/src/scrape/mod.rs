pub mod adapter;
pub mod browser;
pub mod export;
pub mod item;
pub mod params;
pub mod worker;

#[cfg(test)]
pub(crate) mod fakes;

pub use adapter::{AdapterError, AdapterRegistry, SiteAdapter};
pub use browser::{BrowserError, BrowserLauncher, BrowserSession, PageController};
pub use item::ScrapedItem;
pub use worker::{JobWorker, ScrapeError, WorkerConfig, WorkerResult};
