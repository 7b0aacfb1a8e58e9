use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::scrape::item::ScrapedItem;

pub const DEFAULT_MAX_PAGES: u32 = 10;

/// Legacy `maxPages` value meaning "every available page".
pub const ALL_PAGES_SENTINEL: u64 = 999;

#[derive(Debug, thiserror::Error)]
pub enum ParamError {
    #[error("maxPages must be a positive integer or \"all\", got {0}")]
    InvalidMaxPages(Value),

    #[error("enrichment parameters: {0}")]
    Enrich(#[from] serde_json::Error),

    #[error("enrichment job requires a non-empty item_urls list")]
    NoItemUrls,
}

/// How many listing pages a scrape job may visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageBudget {
    Capped(u32),
    All,
}

impl Default for PageBudget {
    fn default() -> Self {
        PageBudget::Capped(DEFAULT_MAX_PAGES)
    }
}

impl PageBudget {
    /// Reads `maxPages` from job parameters.
    pub fn from_parameters(parameters: &Value) -> Result<Self, ParamError> {
        match parameters.get("maxPages") {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(Value::Number(n)) => match n.as_u64() {
                Some(ALL_PAGES_SENTINEL) => Ok(PageBudget::All),
                Some(0) => Ok(Self::default()),
                Some(v) => Ok(PageBudget::Capped(u32::try_from(v).unwrap_or(u32::MAX))),
                None => Err(ParamError::InvalidMaxPages(Value::Number(n.clone()))),
            },
            Some(Value::String(s)) if s.trim().eq_ignore_ascii_case("all") => Ok(PageBudget::All),
            Some(Value::String(s)) => match s.trim().parse::<u64>() {
                Ok(ALL_PAGES_SENTINEL) => Ok(PageBudget::All),
                Ok(0) => Ok(Self::default()),
                Ok(v) => Ok(PageBudget::Capped(u32::try_from(v).unwrap_or(u32::MAX))),
                Err(_) => Err(ParamError::InvalidMaxPages(Value::String(s.clone()))),
            },
            Some(other) => Err(ParamError::InvalidMaxPages(other.clone())),
        }
    }

    /// `min(cap, available)` for a capped budget, `available` otherwise.
    pub fn pages_to_scrape(&self, total_available: u32) -> u32 {
        let available = total_available.max(1);
        match self {
            PageBudget::Capped(cap) => (*cap).min(available),
            PageBudget::All => available,
        }
    }
}

impl std::fmt::Display for PageBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PageBudget::Capped(n) => write!(f, "{n}"),
            PageBudget::All => f.write_str("ALL"),
        }
    }
}

/// Inputs of an enrichment job.
#[derive(Debug, Clone, Deserialize)]
pub struct EnrichParams {
    #[serde(alias = "venueUrls")]
    pub item_urls: Vec<String>,

    #[serde(default, alias = "originalData")]
    pub known_items: Vec<Value>,
}

impl EnrichParams {
    pub fn from_parameters(parameters: &Value) -> Result<Self, ParamError> {
        let params = EnrichParams::deserialize(parameters)?;
        if params.item_urls.is_empty() {
            return Err(ParamError::NoItemUrls);
        }
        Ok(params)
    }

    /// Previously-known items keyed by `url`; entries without one are ignored.
    pub fn known_by_url(&self) -> HashMap<String, ScrapedItem> {
        self.known_items
            .iter()
            .filter_map(|v| ScrapedItem::from_value(v.clone()))
            .filter_map(|item| item.url().map(str::to_string).map(|url| (url, item)))
            .collect()
    }
}
