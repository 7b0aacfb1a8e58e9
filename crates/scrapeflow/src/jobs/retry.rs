use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            exponential: true,
        }
    }
}

impl RetryConfig {
    /// Navigation policy: three attempts starting at 2s.
    pub fn navigation() -> Self {
        Self {
            initial_delay: Duration::from_millis(2000),
            ..Self::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("failed after {attempts} attempts: {source}")]
    Exhausted { attempts: u32, source: E },

    #[error("{0}")]
    Aborted(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { source, .. } => source,
            RetryError::Aborted(e) => e,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
}

/// Message-based classification: network failures, timeouts and 5xx are
/// retryable; anything else (4xx, selector/parse failures) is not.
pub fn classify_error(message: &str) -> ErrorClass {
    let m = message.to_lowercase();

    const RETRYABLE: &[&str] = &[
        "net::err",
        "network",
        "connection",
        "timeout",
        "timed out",
        "500",
        "502",
        "503",
        "504",
    ];

    if RETRYABLE.iter().any(|needle| m.contains(needle)) {
        ErrorClass::Retryable
    } else {
        ErrorClass::NonRetryable
    }
}

pub fn is_retryable_error(message: &str) -> bool {
    classify_error(message) == ErrorClass::Retryable
}

/// Delay before the retry that follows `attempt` (0-based).
pub fn next_delay(attempt: u32, cfg: &RetryConfig) -> Duration {
    if !cfg.exponential {
        return cfg.initial_delay;
    }

    // Compute 2^attempt safely; let the cap handle overflow.
    let pow2 = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
    cfg.initial_delay
        .checked_mul(pow2)
        .unwrap_or(cfg.max_delay)
        .min(cfg.max_delay)
}

/// Runs `op` until it succeeds or `max_retries` attempts are spent.
pub async fn retry_with_backoff<T, E, F, Fut>(cfg: &RetryConfig, op: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry_with_backoff_if(cfg, op, |_| true).await
}

/// Like [`retry_with_backoff`], but stops at the first error `should_retry`
/// rejects and returns it as [`RetryError::Aborted`].
pub async fn retry_with_backoff_if<T, E, F, Fut, P>(
    cfg: &RetryConfig,
    mut op: F,
    should_retry: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let attempts = cfg.max_retries.max(1);
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if !should_retry(&e) => return Err(RetryError::Aborted(e)),
            Err(e) => {
                if attempt + 1 >= attempts {
                    return Err(RetryError::Exhausted {
                        attempts,
                        source: e,
                    });
                }

                let delay = next_delay(attempt, cfg);
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// `{min,max}` milliseconds window an inter-request delay is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub min: u64,
    pub max: u64,
}

impl RateLimit {
    pub const fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }
}

pub fn draw_delay_ms(min: u64, max: u64, rng: &mut impl Rng) -> u64 {
    let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
    rng.gen_range(lo..=hi)
}

/// Sleeps a uniformly drawn number of milliseconds in `[min, max]` and
/// returns the value actually used.
pub async fn random_delay(min: u64, max: u64) -> u64 {
    let ms = draw_delay_ms(min, max, &mut rand::thread_rng());
    tokio::time::sleep(Duration::from_millis(ms)).await;
    ms
}
