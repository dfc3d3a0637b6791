//! Binance spot klines source.
//!
//! `GET /api/v3/klines?symbol&interval&startTime&limit` returns rows of
//! `[openTime, "open", "high", "low", "close", "volume", closeTime, ...]`,
//! oldest first, starting at the first bucket whose open time is ≥ `startTime`.

use super::exchange::{get_body, market_id};
use super::provider::{CandleSource, FetchRequest, SourceError};
use crate::domain::{parse_decimal, Candle};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

/// Error payload Binance sends with 4xx responses.
#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

pub struct BinanceSource {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl BinanceSource {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.binance.com";
    pub const MAX_LIMIT: u32 = 1000;

    pub fn with_client(client: reqwest::blocking::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn klines_url(&self) -> String {
        format!("{}/api/v3/klines", self.base_url)
    }

    fn parse_error(body: &str) -> Option<SourceError> {
        serde_json::from_str::<ApiError>(body)
            .ok()
            .map(|e| SourceError::Exchange {
                code: e.code,
                message: e.msg,
            })
    }

    /// Parse a klines response body into candles.
    pub(crate) fn parse_klines(body: &str) -> Result<Vec<Candle>, SourceError> {
        let rows: Vec<Vec<Value>> = serde_json::from_str(body).map_err(|e| {
            if let Some(err) = Self::parse_error(body) {
                return err;
            }
            SourceError::ResponseFormatChanged(format!("klines is not an array of rows: {e}"))
        })?;

        rows.iter()
            .enumerate()
            .map(|(i, row)| parse_row(row).map_err(|reason| {
                SourceError::ResponseFormatChanged(format!("kline {i}: {reason}"))
            }))
            .collect()
    }
}

fn parse_row(row: &[Value]) -> Result<Candle, String> {
    if row.len() < 6 {
        return Err(format!("expected at least 6 fields, got {}", row.len()));
    }
    let timestamp = row[0]
        .as_i64()
        .ok_or_else(|| format!("open time {} is not an integer", row[0]))?;
    let field = |i: usize| -> Result<Decimal, String> {
        let parsed = match &row[i] {
            Value::String(s) => parse_decimal(s),
            Value::Number(n) => parse_decimal(&n.to_string()),
            _ => None,
        };
        parsed.ok_or_else(|| format!("field {i} ({}) is not a decimal", row[i]))
    };
    Ok(Candle {
        timestamp,
        open: field(1)?,
        high: field(2)?,
        low: field(3)?,
        close: field(4)?,
        volume: field(5)?,
    })
}

impl CandleSource for BinanceSource {
    fn name(&self) -> &str {
        "binance"
    }

    fn fetch_ohlcv(&self, request: &FetchRequest) -> Result<Vec<Candle>, SourceError> {
        let query = [
            ("symbol", market_id(&request.symbol)),
            ("interval", request.timeframe.code().to_string()),
            ("startTime", request.since.to_string()),
            ("limit", request.limit.clamp(1, Self::MAX_LIMIT).to_string()),
        ];
        let body = get_body(
            &self.client,
            &self.klines_url(),
            &query,
            &request.symbol,
            Self::parse_error,
        )?;
        Self::parse_klines(&body)
    }
}
