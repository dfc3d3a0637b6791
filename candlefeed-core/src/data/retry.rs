//! Bounded retry around a single paginated source call.
//!
//! The same request is re-sent unmodified until it succeeds or the attempt
//! budget is spent. The default policy retries immediately; a fixed or
//! exponential delay (with optional jitter) can be configured. Rate-limit
//! answers always wait at least their `Retry-After`.

use super::provider::{CandleSource, FetchRequest, SourceError};
use crate::domain::Candle;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Delay between failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately.
    #[default]
    None,
    /// Wait the same delay before every retry.
    Fixed { delay_ms: u64 },
    /// Double the delay after each failure, capped at `max_ms`.
    Exponential {
        base_ms: u64,
        max_ms: u64,
        #[serde(default)]
        jitter: bool,
    },
}

impl Backoff {
    /// Delay to wait before attempt number `attempt` (1-based, so attempt 2 is
    /// the first retry).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential {
                base_ms,
                max_ms,
                jitter,
            } => {
                let exp = (attempt - 2).min(32);
                let ms = base_ms.saturating_mul(1u64 << exp).min(max_ms);
                let ms = if jitter && ms > 0 {
                    rand::thread_rng().gen_range(ms / 2..=ms)
                } else {
                    ms
                };
                Duration::from_millis(ms)
            }
        }
    }
}

/// How many attempts a request gets, and how long to wait between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per request. 0 and 1 both mean a single attempt.
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::None,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Wait after failed attempt number `attempt`. A rate-limit answer is
    /// never retried sooner than its `Retry-After`.
    pub fn delay_after(&self, attempt: u32, error: &SourceError) -> Duration {
        let backoff = self.backoff.delay_before(attempt + 1);
        match error {
            SourceError::RateLimited { retry_after_secs } => {
                backoff.max(Duration::from_secs(*retry_after_secs))
            }
            _ => backoff,
        }
    }

    /// Attempts actually made before giving up.
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5)
    }
}

/// The source kept failing for the whole attempt budget.
#[derive(Debug, Error)]
#[error("fetch of {symbol} {timeframe} since {since} failed after {attempts} attempt(s): {last}")]
pub struct FetchError {
    pub symbol: String,
    pub timeframe: String,
    pub since: i64,
    pub attempts: u32,
    #[source]
    pub last: SourceError,
}

/// Wraps a [`CandleSource`] with a bounded retry loop.
pub struct RetryingFetcher<'a, S: CandleSource + ?Sized> {
    source: &'a S,
    policy: RetryPolicy,
    sleep: fn(Duration),
}

impl<'a, S: CandleSource + ?Sized> RetryingFetcher<'a, S> {
    pub fn new(source: &'a S, policy: RetryPolicy) -> Self {
        Self {
            source,
            policy,
            sleep: std::thread::sleep,
        }
    }

    #[cfg(test)]
    fn with_sleep(mut self, sleep: fn(Duration)) -> Self {
        self.sleep = sleep;
        self
    }

    /// Fetch one page, retrying the identical request on failure.
    pub fn fetch(&self, request: &FetchRequest) -> Result<Vec<Candle>, FetchError> {
        let attempts = self.policy.attempts();
        let mut attempt = 1;

        loop {
            debug!(
                source = self.source.name(),
                symbol = %request.symbol,
                timeframe = %request.timeframe,
                since = request.since,
                limit = request.limit,
                attempt,
                "fetching candles"
            );

            match self.source.fetch_ohlcv(request) {
                Ok(candles) => return Ok(candles),
                Err(e) if attempt < attempts => {
                    let delay = self.policy.delay_after(attempt, &e);
                    warn!(
                        source = self.source.name(),
                        attempt,
                        of = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "fetch failed, retrying: {e}"
                    );
                    if !delay.is_zero() {
                        (self.sleep)(delay);
                    }
                    attempt += 1;
                }
                Err(e) => {
                    return Err(FetchError {
                        symbol: request.symbol.clone(),
                        timeframe: request.timeframe.to_string(),
                        since: request.since,
                        attempts: attempt,
                        last: e,
                    });
                }
            }
        }
    }
}
