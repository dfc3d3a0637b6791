//! Ingestion configuration, loadable from TOML.
//!
//! ```toml
//! exchange = "bybit"
//! symbol = "ETH/USDT"
//! timeframe = "15m"
//! page_limit = 500
//! max_retries = 3
//! since = "2024-01-01"
//! directory = "data"
//!
//! [backoff]
//! type = "exponential"
//! base_ms = 250
//! max_ms = 8000
//! ```
//!
//! Every key is optional. `since` must be quoted when given as a date.

use crate::data::download::IngestPlan;
use crate::data::exchange::{ExchangeKind, UnknownExchange};
use crate::data::retry::{Backoff, RetryPolicy};
use crate::domain::{Timeframe, UnknownTimeframe};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    UnknownExchange(#[from] UnknownExchange),

    #[error("invalid config: {0}")]
    UnknownTimeframe(#[from] UnknownTimeframe),

    #[error("invalid start date '{0}' (expected epoch milliseconds, YYYY-MM-DD or an ISO-8601 datetime)")]
    InvalidSince(String),

    #[error("page_limit must be at least 1")]
    ZeroPageLimit,
}

/// Where to start when the store is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Since {
    Millis(i64),
    Text(String),
}

impl Default for Since {
    fn default() -> Self {
        Since::Millis(0)
    }
}

impl Since {
    /// Resolve to epoch milliseconds. Naive dates and datetimes are taken as UTC.
    pub fn to_millis(&self) -> Result<i64, ConfigError> {
        match self {
            Since::Millis(ms) => Ok(*ms),
            Since::Text(text) => parse_since(text),
        }
    }
}

/// Parse a start cursor given as epoch ms, `YYYY-MM-DD`, RFC 3339, or a naive
/// `YYYY-MM-DD[T ]HH:MM:SS` datetime.
pub fn parse_since(text: &str) -> Result<i64, ConfigError> {
    let text = text.trim();
    if let Ok(ms) = text.parse::<i64>() {
        return Ok(ms);
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc().timestamp_millis());
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.timestamp_millis());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Ok(dt.and_utc().timestamp_millis());
        }
    }
    Err(ConfigError::InvalidSince(text.to_string()))
}

/// One symbol/timeframe download job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub exchange: ExchangeKind,
    /// Unified `BASE/QUOTE` symbol.
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Candles requested per call.
    pub page_limit: u32,
    /// Attempts per page; 0 and 1 both mean a single attempt.
    pub max_retries: u32,
    pub backoff: Backoff,
    pub since: Since,
    /// Output directory used when `file` is not set.
    pub directory: PathBuf,
    /// Explicit output file, overriding the inferred name.
    pub file: Option<PathBuf>,
    /// Alternative API root (testnet, mirror).
    pub base_url: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            exchange: ExchangeKind::Binance,
            symbol: "BTC/USDT".to_string(),
            timeframe: Timeframe::H1,
            page_limit: 100,
            max_retries: 5,
            backoff: Backoff::None,
            since: Since::default(),
            directory: PathBuf::from("./ohlcv-data"),
            file: None,
            base_url: None,
        }
    }
}

impl IngestConfig {
    /// Load a config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string.
    ///
    /// Unknown exchange and timeframe names get their own error variants
    /// rather than a generic parse error.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let table = content.parse::<toml::Table>()?;
        if let Some(name) = table.get("exchange").and_then(|v| v.as_str()) {
            name.parse::<ExchangeKind>()?;
        }
        if let Some(code) = table.get("timeframe").and_then(|v| v.as_str()) {
            code.parse::<Timeframe>()?;
        }
        Ok(toml::Value::Table(table).try_into()?)
    }

    /// `{exchange}-{symbol}-{timeframe}.csv` with slashes and colons in the
    /// symbol turned into dashes.
    pub fn file_name(&self) -> String {
        let symbol = self.symbol.replace(['/', ':'], "-");
        format!("{}-{}-{}.csv", self.exchange, symbol, self.timeframe)
    }

    /// The CSV file this job reads and appends to.
    pub fn output_path(&self) -> PathBuf {
        match &self.file {
            Some(file) => file.clone(),
            None => self.directory.join(self.file_name()),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries).with_backoff(self.backoff)
    }

    /// Validate and lower into the plan the orchestrator runs.
    pub fn plan(&self) -> Result<IngestPlan, ConfigError> {
        if self.page_limit == 0 {
            return Err(ConfigError::ZeroPageLimit);
        }
        Ok(IngestPlan {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            page_limit: self.page_limit,
            retry: self.retry_policy(),
            start_cursor: self.since.to_millis()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = IngestConfig::default();
        assert_eq!(config.exchange, ExchangeKind::Binance);
        assert_eq!(config.timeframe, Timeframe::H1);
        assert_eq!(config.page_limit, 100);
        assert_eq!(config.max_retries, 5);
        assert_eq!(
            config.output_path(),
            PathBuf::from("./ohlcv-data/binance-BTC-USDT-1h.csv")
        );
        assert_eq!(config.plan().unwrap().start_cursor, 0);
    }

    #[test]
    fn empty_toml_is_default() {
        assert_eq!(IngestConfig::from_toml("").unwrap(), IngestConfig::default());
    }

    #[test]
    fn parses_full_toml() {
        let config = IngestConfig::from_toml(
            r#"
            exchange = "bybit"
            symbol = "ETH/USDT:USDT"
            timeframe = "15m"
            page_limit = 500
            max_retries = 3
            since = "2024-01-01"
            directory = "data"
            base_url = "https://api-testnet.bybit.com"

            [backoff]
            type = "fixed"
            delay_ms = 100
            "#,
        )
        .unwrap();

        assert_eq!(config.exchange, ExchangeKind::Bybit);
        assert_eq!(config.timeframe, Timeframe::M15);
        assert_eq!(config.backoff, Backoff::Fixed { delay_ms: 100 });
        assert_eq!(
            config.output_path(),
            PathBuf::from("data/bybit-ETH-USDT-USDT-15m.csv")
        );

        let plan = config.plan().unwrap();
        assert_eq!(plan.page_limit, 500);
        assert_eq!(plan.start_cursor, 1_704_067_200_000);
        assert_eq!(plan.retry.attempts(), 3);
    }

    #[test]
    fn explicit_file_wins() {
        let config = IngestConfig {
            file: Some(PathBuf::from("/tmp/btc.csv")),
            ..Default::default()
        };
        assert_eq!(config.output_path(), PathBuf::from("/tmp/btc.csv"));
    }

    #[test]
    fn integer_since_is_millis() {
        let config = IngestConfig::from_toml("since = 1500000000000").unwrap();
        assert_eq!(config.since, Since::Millis(1_500_000_000_000));
    }

    #[test]
    fn rejects_unknown_exchange_and_timeframe() {
        match IngestConfig::from_toml(r#"exchange = "kraken""#) {
            Err(ConfigError::UnknownExchange(e)) => assert_eq!(e, UnknownExchange("kraken".into())),
            other => panic!("unexpected result: {other:?}"),
        }
        match IngestConfig::from_toml(r#"timeframe = "7m""#) {
            Err(ConfigError::UnknownTimeframe(e)) => assert_eq!(e, UnknownTimeframe("7m".into())),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn wrongly_typed_values_are_parse_errors() {
        assert!(matches!(
            IngestConfig::from_toml("exchange = 3"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            IngestConfig::from_toml("page_limit = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn rejects_zero_page_limit() {
        let config = IngestConfig {
            page_limit: 0,
            ..Default::default()
        };
        assert!(matches!(config.plan(), Err(ConfigError::ZeroPageLimit)));
    }

    #[test]
    fn since_formats() {
        assert_eq!(parse_since("1704067200000").unwrap(), 1_704_067_200_000);
        assert_eq!(parse_since("2024-01-01").unwrap(), 1_704_067_200_000);
        assert_eq!(
            parse_since("2024-01-01T01:00:00Z").unwrap(),
            1_704_070_800_000
        );
        assert_eq!(
            parse_since("2024-01-01T02:00:00+01:00").unwrap(),
            1_704_070_800_000
        );
        assert_eq!(
            parse_since("2024-01-01 00:00:01").unwrap(),
            1_704_067_201_000
        );
        assert!(matches!(
            parse_since("yesterday"),
            Err(ConfigError::InvalidSince(_))
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = IngestConfig::from_file(Path::new("/nonexistent/candlefeed.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/candlefeed.toml"));
    }
}
