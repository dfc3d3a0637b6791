//! Exchange selection and the HTTP plumbing shared by the exchange sources.

use super::binance::BinanceSource;
use super::bybit::BybitSource;
use super::provider::{CandleSource, SourceError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Supported exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ExchangeKind {
    Binance,
    Bybit,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown exchange '{0}' (supported: binance, bybit)")]
pub struct UnknownExchange(pub String);

impl ExchangeKind {
    pub fn id(self) -> &'static str {
        match self {
            ExchangeKind::Binance => "binance",
            ExchangeKind::Bybit => "bybit",
        }
    }

    /// Build the source for this exchange, optionally against another base URL
    /// (testnets, mirrors, local fixtures).
    pub fn build_source(self, base_url: Option<&str>) -> Result<Box<dyn CandleSource>, SourceError> {
        let client = http_client()?;
        Ok(match self {
            ExchangeKind::Binance => Box::new(BinanceSource::with_client(
                client,
                base_url.unwrap_or(BinanceSource::DEFAULT_BASE_URL),
            )),
            ExchangeKind::Bybit => Box::new(BybitSource::with_client(
                client,
                base_url.unwrap_or(BybitSource::DEFAULT_BASE_URL),
            )),
        })
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for ExchangeKind {
    type Err = UnknownExchange;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binance" => Ok(ExchangeKind::Binance),
            "bybit" => Ok(ExchangeKind::Bybit),
            _ => Err(UnknownExchange(s.to_string())),
        }
    }
}

impl TryFrom<String> for ExchangeKind {
    type Error = UnknownExchange;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ExchangeKind> for String {
    fn from(kind: ExchangeKind) -> Self {
        kind.id().to_string()
    }
}

/// Exchange market id for a unified symbol: `BTC/USDT` → `BTCUSDT`,
/// `BTC/USDT:USDT` → `BTCUSDT`.
pub fn market_id(symbol: &str) -> String {
    let spot = symbol.split(':').next().unwrap_or(symbol);
    spot.replace('/', "").trim().to_ascii_uppercase()
}

pub(crate) fn http_client() -> Result<reqwest::blocking::Client, SourceError> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .user_agent(concat!("candlefeed/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| SourceError::Client(e.to_string()))
}

/// Send a GET and return the body of a successful response.
///
/// Rate limiting and bans map to their own variants; any other non-2xx status
/// is handed to `parse_error` so the exchange can surface its error code.
pub(crate) fn get_body(
    client: &reqwest::blocking::Client,
    url: &str,
    query: &[(&str, String)],
    symbol: &str,
    parse_error: impl Fn(&str) -> Option<SourceError>,
) -> Result<String, SourceError> {
    let resp = client.get(url).query(query).send().map_err(|e| {
        if e.is_connect() || e.is_timeout() {
            SourceError::NetworkUnreachable(e.to_string())
        } else {
            SourceError::Other(e.to_string())
        }
    })?;

    let status = resp.status();

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(60);
        return Err(SourceError::RateLimited {
            retry_after_secs: retry_after,
        });
    }

    // 418 is Binance's "IP auto-banned" status.
    if status == reqwest::StatusCode::FORBIDDEN || status.as_u16() == 418 {
        return Err(SourceError::Blocked {
            status: status.as_u16(),
        });
    }

    let body = resp
        .text()
        .map_err(|e| SourceError::ResponseFormatChanged(format!("unreadable body: {e}")))?;

    if !status.is_success() {
        return Err(parse_error(&body).unwrap_or(SourceError::HttpStatus {
            status: status.as_u16(),
            symbol: symbol.to_string(),
        }));
    }

    Ok(body)
}
