use std::sync::Arc;

use scrapeflow::scrape::AdapterRegistry;

pub mod theknot;

pub use theknot::TheKnotAdapter;

pub fn build_registry() -> AdapterRegistry {
    AdapterRegistry::new().with(theknot::SITE, Arc::new(TheKnotAdapter::new()))
}
