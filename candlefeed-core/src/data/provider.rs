//! Candle source trait, clock, progress observer, and structured error types.
//!
//! The CandleSource trait abstracts over exchanges (Binance, Bybit) so we can
//! swap implementations and script them in tests.

use crate::domain::{iso8601, Candle, Symbol, Timeframe};
use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use super::ingest::IngestOutcome;

/// Parameters for one paginated call: candles at or after `since`, at most `limit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub since: i64,
    pub limit: u32,
}

impl FetchRequest {
    pub fn new(symbol: impl Into<Symbol>, timeframe: Timeframe, since: i64, limit: u32) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            since,
            limit,
        }
    }
}

/// A single failed source call.
///
/// These are designed to be displayable in log lines and in the CLI's abort
/// message.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by exchange (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("requests blocked by exchange (HTTP {status})")]
    Blocked { status: u16 },

    #[error("HTTP {status} for {symbol}")]
    HttpStatus { status: u16, symbol: String },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("exchange error {code}: {message}")]
    Exchange { code: i64, message: String },

    #[error("timeframe {timeframe} not supported by {exchange}")]
    UnsupportedTimeframe {
        exchange: &'static str,
        timeframe: Timeframe,
    },

    #[error("http client setup failed: {0}")]
    Client(String),

    #[error("source error: {0}")]
    Other(String),
}

/// Trait for exchange candle sources.
///
/// Implementations return candles in ascending timestamp order within one
/// response. They know nothing about the store or the cursor.
pub trait CandleSource: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// Fetch one page of candles for `request`.
    fn fetch_ohlcv(&self, request: &FetchRequest) -> Result<Vec<Candle>, SourceError>;
}

impl<S: CandleSource + ?Sized> CandleSource for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn fetch_ohlcv(&self, request: &FetchRequest) -> Result<Vec<Candle>, SourceError> {
        (**self).fetch_ohlcv(request)
    }
}

/// Wall-clock source for the live edge.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// UTC system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock frozen at a fixed instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now_millis(&self) -> i64 {
        self.0
    }
}

/// Cumulative progress after a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    /// Rows written by this append.
    pub batch_len: usize,
    /// Rows written so far in this run.
    pub total: usize,
    /// First timestamp ingested in this run.
    pub first_timestamp: i64,
    /// Last timestamp ingested in this run.
    pub last_timestamp: i64,
}

/// Observer for ingestion progress.
pub trait IngestProgress {
    /// Called after each batch is durably appended.
    fn on_batch(&self, progress: &BatchProgress);

    /// Called when the cursor filter discarded candles from a response.
    fn on_filtered(&self, dropped: usize, cursor: i64);

    /// Called once when the loop reaches a terminal state.
    fn on_finished(&self, outcome: &IngestOutcome);
}

/// Progress reporter that logs through `tracing`.
pub struct TracingProgress;

impl IngestProgress for TracingProgress {
    fn on_batch(&self, progress: &BatchProgress) {
        info!(
            batch = progress.batch_len,
            "{} candles in total from {} to {}",
            progress.total,
            iso8601(progress.first_timestamp),
            iso8601(progress.last_timestamp),
        );
    }

    fn on_filtered(&self, dropped: usize, cursor: i64) {
        warn!(
            dropped,
            "discarded candles before cursor {}",
            iso8601(cursor)
        );
    }

    fn on_finished(&self, outcome: &IngestOutcome) {
        info!(
            stop = ?outcome.stop,
            appended = outcome.appended,
            dropped = outcome.dropped,
            fetches = outcome.fetches,
            "ingestion finished, next cursor {}",
            iso8601(outcome.cursor)
        );
    }
}

/// Progress reporter that reports nothing.
pub struct NoProgress;

impl IngestProgress for NoProgress {
    fn on_batch(&self, _progress: &BatchProgress) {}

    fn on_filtered(&self, _dropped: usize, _cursor: i64) {}

    fn on_finished(&self, _outcome: &IngestOutcome) {}
}
