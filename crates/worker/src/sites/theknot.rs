use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use scrapeflow::jobs::retry::RateLimit;
use scrapeflow::scrape::adapter::{AdapterError, SiteAdapter};
use scrapeflow::scrape::browser::PageController;
use scrapeflow::scrape::item::ScrapedItem;

pub const SITE: &str = "theknot";

const BASE_URL: &str = "https://www.theknot.com";
const DEFAULT_CATEGORY: &str = "wedding-reception-venues";
const DEFAULT_LOCATION: &str = "seattle-wa";

const CARD_SELECTOR: &str = r#"[data-testid="vendor-card-base"]"#;

const NEXT_PAGE_SELECTORS: &[&str] = &[
    r#"a[aria-label="Go to next page"]"#,
    r#"a[aria-label*="next"]"#,
    r#"button[aria-label="Go to next page"]"#,
    r#"button[aria-label*="next"]"#,
    r#"[data-testid*="next"]"#,
    ".pagination a:last-child:not(.disabled)",
    r#"nav[aria-label*="pagination"] a:last-child"#,
];

const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_content",
    "utm_term",
    "ref",
    "source",
];

/// Collects the raw text of every vendor card; all cleanup happens in Rust.
const CARDS_SCRIPT: &str = r#"
(() => Array.from(document.querySelectorAll('[data-testid="vendor-card-base"]')).map((card) => {
  const texts = (sel) => Array.from(card.querySelectorAll(sel)).map((el) => (el.textContent || '').trim());
  const labelId = card.getAttribute('aria-labelledby');
  const label = labelId ? document.getElementById(labelId) : null;
  const link = card.querySelector('a[href*="/marketplace/"]');
  const isNew = Array.from(card.querySelectorAll('*')).some((el) => {
    const cls = String(el.className || '');
    return (cls.includes('badge') || cls.includes('new') || cls.includes('review'))
      && (el.textContent || '').trim() === 'New';
  });
  return {
    name: label ? (label.textContent || '').trim() : '',
    href: link ? (link.getAttribute('href') || '') : '',
    locations: texts('[class*="location"], [class*="address"]'),
    isNew,
    ratings: texts('[class*="rating"], [class*="star"]'),
    reviews: texts('[class*="review"]'),
    prices: texts('[class*="price"], [class*="starting"]'),
  };
}))()
"#;

const PAGINATION_SCRIPT: &str = r#"
(() => {
  const nav = document.querySelector('nav[aria-label*="pagination"], [class*="pagination"]');
  return {
    text: document.body ? (document.body.innerText || '') : '',
    labels: Array.from(document.querySelectorAll('a[aria-label*="Go to page"], button[aria-label*="Go to page"]'))
      .map((el) => el.getAttribute('aria-label') || ''),
    navTexts: nav ? Array.from(nav.querySelectorAll('a, button')).map((el) => (el.textContent || '').trim()) : [],
  };
})()
"#;

const SOCIAL_LINKS_SELECTOR: &str = r#"[class*="social-links"] a[href]"#;

static PAGE_OF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)page\s+\d+\s+of\s+(\d+)").unwrap());
static PAGE_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)page (\d+)").unwrap());
static CITY_STATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Za-z\s]+),\s*([A-Z]{2})").unwrap());
static LOCATION_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)location:").unwrap());
static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\d.]+)").unwrap());
static REVIEW_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\((\d+)\)|(\d+)\s*Reviews?").unwrap());

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawCard {
    name: String,
    href: String,
    locations: Vec<String>,
    is_new: bool,
    ratings: Vec<String>,
    reviews: Vec<String>,
    prices: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PaginationHints {
    text: String,
    labels: Vec<String>,
    nav_texts: Vec<String>,
}

/// Venue listings on theknot.com marketplace.
#[derive(Debug, Clone, Default)]
pub struct TheKnotAdapter;

impl TheKnotAdapter {
    pub fn new() -> Self {
        Self
    }

    async fn enabled_next_selector(
        &self,
        page: &dyn PageController,
    ) -> Result<Option<&'static str>, AdapterError> {
        for selector in NEXT_PAGE_SELECTORS {
            let enabled = page.evaluate(&enabled_script(selector)).await?;
            if enabled.as_bool().unwrap_or(false) {
                return Ok(Some(*selector));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl SiteAdapter for TheKnotAdapter {
    fn build_url(&self, parameters: &Value) -> Result<String, AdapterError> {
        let slug = |key: &str, default: &str| -> Result<String, AdapterError> {
            match parameters.get(key) {
                None | Some(Value::Null) => Ok(default.to_string()),
                Some(Value::String(s)) if s.trim().is_empty() => Ok(default.to_string()),
                Some(Value::String(s)) => Ok(s.trim().to_string()),
                Some(other) => Err(AdapterError::InvalidParameters(format!(
                    "{key} must be a string, got {other}"
                ))),
            }
        };

        let category = slug("category", DEFAULT_CATEGORY)?;
        let location = slug("location", DEFAULT_LOCATION)?;
        let mut url = format!("{BASE_URL}/marketplace/{category}-{location}");

        if let Some(page) = parameters.get("page").and_then(Value::as_u64) {
            if page > 1 {
                url.push_str(&format!("?page={page}"));
            }
        }
        Ok(url)
    }

    async fn total_pages(&self, page: &dyn PageController) -> u32 {
        // Pagination renders after the cards.
        tokio::time::sleep(Duration::from_secs(2)).await;

        match page.evaluate(PAGINATION_SCRIPT).await {
            Ok(raw) => {
                let hints: PaginationHints = serde_json::from_value(raw).unwrap_or_default();
                let total = total_from_hints(&hints);
                tracing::info!(total_pages = total, "detected pagination");
                total
            }
            Err(e) => {
                tracing::warn!(error = %e, "pagination detection failed, assuming one page");
                1
            }
        }
    }

    async fn extract_data(
        &self,
        page: &dyn PageController,
    ) -> Result<Vec<ScrapedItem>, AdapterError> {
        if !page.wait_for(CARD_SELECTOR, Duration::from_secs(10)).await? {
            tracing::warn!("no vendor cards on page");
            return Ok(vec![]);
        }

        let raw = page.evaluate(CARDS_SCRIPT).await?;
        let cards: Vec<RawCard> = serde_json::from_value(raw)
            .map_err(|e| AdapterError::Extraction(format!("unexpected card payload: {e}")))?;

        let total = cards.len();
        let items: Vec<ScrapedItem> = cards.into_iter().filter_map(card_to_item).collect();
        tracing::info!(
            extracted = items.len(),
            skipped = total - items.len(),
            "extracted venues"
        );
        Ok(items)
    }

    async fn has_next_page(&self, page: &dyn PageController) -> Result<bool, AdapterError> {
        match self.enabled_next_selector(page).await {
            Ok(found) => Ok(found.is_some()),
            Err(e) => {
                tracing::warn!(error = %e, "next page check failed, treating as last page");
                Ok(false)
            }
        }
    }

    async fn go_to_next_page(&self, page: &dyn PageController) -> Result<(), AdapterError> {
        let selector = self
            .enabled_next_selector(page)
            .await?
            .ok_or(AdapterError::NoNextPage)?;

        let before = page.current_url().await?;
        page.click(selector).await?;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        while tokio::time::Instant::now() < deadline {
            if page.current_url().await? != before {
                break;
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        page.wait_for(CARD_SELECTOR, Duration::from_secs(15)).await?;

        // Let late cards settle.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let after = page.current_url().await?;
        tracing::debug!(selector, url = ?after, "moved to next page");
        Ok(())
    }

    async fn extract_detailed_data(
        &self,
        page: &dyn PageController,
        item_url: &str,
    ) -> Result<ScrapedItem, AdapterError> {
        tokio::time::sleep(Duration::from_secs(3)).await;

        if let Some(actual) = page.current_url().await? {
            if actual != item_url {
                tracing::warn!(expected = item_url, actual = %actual, "detail page redirected");
            }
        }

        let hrefs: Vec<String> = page
            .query_attributes(SOCIAL_LINKS_SELECTOR, "href")
            .await?
            .into_iter()
            .flatten()
            .collect();
        let mut details = details_from_links(&hrefs);

        if details.get("phone").is_none() {
            if let Some(phone) = first_with_prefix(page, "tel:").await? {
                details.set("phone", phone);
            }
        }
        if details.get("email").is_none() {
            if let Some(email) = first_with_prefix(page, "mailto:").await? {
                details.set("email", email);
            }
        }

        tracing::debug!(item_url, fields = details.len(), "extracted detail fields");
        Ok(details)
    }

    fn rate_limit(&self) -> RateLimit {
        RateLimit::new(2000, 4000)
    }

    fn detail_rate_limit(&self) -> RateLimit {
        RateLimit::new(3000, 5000)
    }
}

async fn first_with_prefix(
    page: &dyn PageController,
    prefix: &str,
) -> Result<Option<String>, AdapterError> {
    let hrefs = page
        .query_attributes(&format!(r#"a[href^="{prefix}"]"#), "href")
        .await?;
    Ok(hrefs
        .into_iter()
        .flatten()
        .next()
        .map(|href| href.trim_start_matches(prefix).trim().to_string()))
}

fn enabled_script(selector: &str) -> String {
    let quoted = serde_json::to_string(selector).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        "(() => {{ const el = document.querySelector({quoted}); if (!el) return false; \
         return !(el.hasAttribute('disabled') || el.classList.contains('disabled') \
         || el.getAttribute('aria-disabled') === 'true'); }})()"
    )
}

fn total_from_hints(hints: &PaginationHints) -> u32 {
    if let Some(total) = PAGE_OF
        .captures(&hints.text)
        .and_then(|c| c[1].parse::<u32>().ok())
    {
        return total.max(1);
    }

    let from_labels = hints
        .labels
        .iter()
        .filter_map(|label| PAGE_LABEL.captures(label))
        .filter_map(|c| c[1].parse::<u32>().ok())
        .max();
    if let Some(total) = from_labels.filter(|n| *n > 0) {
        return total;
    }

    hints
        .nav_texts
        .iter()
        .filter_map(|t| t.trim().parse::<u32>().ok())
        .filter(|n| *n > 0)
        .max()
        .unwrap_or(1)
}

fn card_to_item(card: RawCard) -> Option<ScrapedItem> {
    let name = card.name.trim().to_string();
    if name.is_empty() || card.href.trim().is_empty() {
        return None;
    }
    let url = absolute_url(card.href.trim());

    let mut item = ScrapedItem::new().with("name", name);
    if let Some(location) = parse_location(&card.locations) {
        item.set("location", location);
    }
    if card.is_new {
        item.set("rating", "New");
    } else if let Some(rating) = parse_rating(&card.ratings) {
        item.set("rating", rating);
    }
    if let Some(reviews) = parse_reviews(&card.reviews) {
        item.set("reviews", reviews);
    }
    if let Some(price) = card
        .prices
        .iter()
        .find(|t| t.to_lowercase().contains("starting") || t.contains('$'))
    {
        item.set("price", price.trim());
    }
    item.set("url", url);
    Some(item)
}

fn absolute_url(href: &str) -> String {
    if href.starts_with("http") {
        href.to_string()
    } else {
        format!("{BASE_URL}{href}")
    }
}

fn parse_location(texts: &[String]) -> Option<String> {
    for text in texts {
        let clean = LOCATION_PREFIX.replace_all(text, "").trim().to_string();

        if let Some(c) = CITY_STATE.captures(&clean) {
            return Some(format!("{}, {}", c[1].trim(), &c[2]));
        }
        if clean.is_empty() {
            continue;
        }

        // Some cards render the city twice back to back.
        let half = clean.len() / 2;
        if clean.is_char_boundary(half) && clean[..half] == clean[half..] {
            return Some(clean[..half].to_string());
        }
        if clean.len() > 3 {
            return Some(clean);
        }
    }
    None
}

fn parse_rating(texts: &[String]) -> Option<Value> {
    let text = texts.iter().find(|t| NUMBER.is_match(t))?;
    let value: f64 = NUMBER.captures(text)?[1].parse().ok()?;
    if value < 0.0 {
        return None;
    }
    serde_json::Number::from_f64(value).map(Value::Number)
}

fn parse_reviews(texts: &[String]) -> Option<u64> {
    texts.iter().find_map(|t| {
        let c = REVIEW_COUNT.captures(t)?;
        c.get(1).or_else(|| c.get(2))?.as_str().parse().ok()
    })
}

fn details_from_links(hrefs: &[String]) -> ScrapedItem {
    let mut details = ScrapedItem::new();

    for href in hrefs {
        let href = href.trim();
        if let Some(phone) = href.strip_prefix("tel:") {
            details.set("phone", phone.trim());
        } else if let Some(email) = href.strip_prefix("mailto:") {
            details.set("email", email.trim());
        } else if let Some(key) = social_network(href) {
            details.set(key, href);
        } else if is_external_website(href) {
            details.set("website", href);
            details.set("website_clean", clean_url(href));
        }
    }
    details
}

static SOCIAL_NETWORKS: [(&str, &[&str]); 4] = [
    ("facebook", &["facebook.com"]),
    ("instagram", &["instagram.com"]),
    ("pinterest", &["pinterest.com"]),
    ("twitter", &["twitter.com", "x.com"]),
];

/// Hosts never reported as a vendor's own website.
const NOT_A_WEBSITE: &[&str] = &["theknot.com", "google.com", "maps.google.com", "goo.gl"];

/// `host` is `domain` or one of its subdomains.
fn host_is(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

fn web_host(href: &str) -> Option<(url::Url, String)> {
    let parsed = url::Url::parse(href).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some((parsed, host))
}

fn social_network(href: &str) -> Option<&'static str> {
    let (parsed, host) = web_host(href)?;
    let &(key, _) = SOCIAL_NETWORKS
        .iter()
        .find(|(_, domains)| domains.iter().any(|d| host_is(&host, d)))?;

    let own_account = parsed
        .path_segments()
        .and_then(|mut segments| segments.next())
        .is_some_and(|first| first.eq_ignore_ascii_case("theknot"));
    (!own_account).then_some(key)
}

fn is_external_website(href: &str) -> bool {
    let Some((_, host)) = web_host(href) else {
        return false;
    };
    let social = SOCIAL_NETWORKS
        .iter()
        .flat_map(|(_, domains)| domains.iter());

    !social
        .chain(NOT_A_WEBSITE.iter())
        .any(|d| host_is(&host, d))
}

fn clean_url(raw: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(raw) else {
        return raw.to_string();
    };

    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !TRACKING_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(kept);
    }
    parsed.to_string()
}
