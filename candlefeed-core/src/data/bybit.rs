//! Bybit v5 spot kline source.
//!
//! `GET /v5/market/kline` answers newest-first and returns the *latest*
//! `limit` candles of the requested `[start, end]` range, so pages are reversed
//! into ascending order and every request is pinned to a window. A window of
//! `limit` buckets can never be truncated. Empty windows (before the listing,
//! or across an exchange outage) are skipped with a doubling stride, and a
//! truncated wide window is bisected back down to its first page. Only a
//! window reaching the present and still empty means there is no newer data.

use super::exchange::{get_body, market_id};
use super::provider::{CandleSource, FetchRequest, SourceError};
use crate::domain::{parse_decimal, Candle, Timeframe};
use chrono::Utc;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct KlineResponse {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: Option<KlineResult>,
}

#[derive(Debug, Deserialize)]
struct KlineResult {
    #[serde(default)]
    list: Vec<Vec<String>>,
}

pub struct BybitSource {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl BybitSource {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.bybit.com";
    pub const MAX_LIMIT: u32 = 1000;

    pub fn with_client(client: reqwest::blocking::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Bybit's interval code, if the timeframe is offered.
    pub fn interval(timeframe: Timeframe) -> Option<&'static str> {
        Some(match timeframe {
            Timeframe::M1 => "1",
            Timeframe::M3 => "3",
            Timeframe::M5 => "5",
            Timeframe::M15 => "15",
            Timeframe::M30 => "30",
            Timeframe::H1 => "60",
            Timeframe::H2 => "120",
            Timeframe::H4 => "240",
            Timeframe::H6 => "360",
            Timeframe::H12 => "720",
            Timeframe::D1 => "D",
            Timeframe::W1 => "W",
            Timeframe::Month1 => "M",
            Timeframe::H8 | Timeframe::D3 => return None,
        })
    }

    fn parse_error(body: &str) -> Option<SourceError> {
        serde_json::from_str::<KlineResponse>(body)
            .ok()
            .filter(|r| r.ret_code != 0)
            .map(|r| SourceError::Exchange {
                code: r.ret_code,
                message: r.ret_msg,
            })
    }

    /// Parse a kline response body into ascending candles.
    pub(crate) fn parse_klines(body: &str) -> Result<Vec<Candle>, SourceError> {
        let resp: KlineResponse = serde_json::from_str(body)
            .map_err(|e| SourceError::ResponseFormatChanged(format!("kline response: {e}")))?;

        if resp.ret_code != 0 {
            return Err(SourceError::Exchange {
                code: resp.ret_code,
                message: resp.ret_msg,
            });
        }

        let rows = resp.result.map(|r| r.list).unwrap_or_default();
        let mut candles = rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                parse_row(row).map_err(|reason| {
                    SourceError::ResponseFormatChanged(format!("kline {i}: {reason}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        candles.reverse();
        Ok(candles)
    }
}

fn parse_row(row: &[String]) -> Result<Candle, String> {
    if row.len() < 6 {
        return Err(format!("expected at least 6 fields, got {}", row.len()));
    }
    let timestamp = row[0]
        .parse::<i64>()
        .map_err(|e| format!("start time '{}': {e}", row[0]))?;
    let field = |i: usize| {
        parse_decimal(&row[i]).ok_or_else(|| format!("field {i} '{}' is not a decimal", row[i]))
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

/// Window stride for calendar months, short enough that `limit` strides never
/// hold more than `limit` monthly buckets.
const MONTH_STRIDE_MS: i64 = 28 * 24 * 60 * 60 * 1000;

/// Earliest candles at or after `since`, given a `query(start, end)` that
/// returns the latest `limit` candles of `[start, end]` in ascending order.
///
/// `page_span` is the width of `limit` buckets; `now` bounds the search.
pub(crate) fn first_page_since(
    since: i64,
    page_span: i64,
    limit: usize,
    now: i64,
    mut query: impl FnMut(i64, i64) -> Result<Vec<Candle>, SourceError>,
) -> Result<Vec<Candle>, SourceError> {
    let page_span = page_span.max(1);
    let mut lo = since;
    let mut span = page_span;

    // Skip empty windows with a doubling stride.
    let mut hi = loop {
        let end = lo.saturating_add(span - 1);
        let candles = query(lo, end)?;
        if candles.is_empty() {
            if end >= now {
                return Ok(candles);
            }
            lo = end + 1;
            span = span.saturating_mul(2);
            continue;
        }
        if span <= page_span || candles.len() < limit {
            return Ok(candles);
        }
        break end;
    };

    // `[lo, hi]` holds more than a page; halve it down to the first one.
    while lo <= hi {
        let mid = lo + (hi - lo) / 2;
        let candles = query(lo, mid)?;
        if candles.is_empty() {
            if mid >= hi {
                break;
            }
            lo = mid + 1;
        } else if mid - lo < page_span || candles.len() < limit {
            return Ok(candles);
        } else {
            hi = mid;
        }
    }
    Ok(Vec::new())
}

impl BybitSource {
    fn fetch_window(
        &self,
        request: &FetchRequest,
        interval: &str,
        limit: u32,
        start: i64,
        end: i64,
    ) -> Result<Vec<Candle>, SourceError> {
        let query = [
            ("category", "spot".to_string()),
            ("symbol", market_id(&request.symbol)),
            ("interval", interval.to_string()),
            ("start", start.to_string()),
            ("end", end.to_string()),
            ("limit", limit.to_string()),
        ];
        let body = get_body(
            &self.client,
            &format!("{}/v5/market/kline", self.base_url),
            &query,
            &request.symbol,
            Self::parse_error,
        )?;
        Self::parse_klines(&body)
    }
}

impl CandleSource for BybitSource {
    fn name(&self) -> &str {
        "bybit"
    }

    fn fetch_ohlcv(&self, request: &FetchRequest) -> Result<Vec<Candle>, SourceError> {
        let interval =
            Self::interval(request.timeframe).ok_or(SourceError::UnsupportedTimeframe {
                exchange: "bybit",
                timeframe: request.timeframe,
            })?;
        let limit = request.limit.clamp(1, Self::MAX_LIMIT);
        let stride = request.timeframe.duration_ms().unwrap_or(MONTH_STRIDE_MS);

        first_page_since(
            request.since,
            stride.saturating_mul(i64::from(limit)),
            limit as usize,
            Utc::now().timestamp_millis(),
            |start, end| self.fetch_window(request, interval, limit, start, end),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::sync::Mutex;

    const BODY: &str = r#"{
        "retCode": 0,
        "retMsg": "OK",
        "result": {
            "category": "spot",
            "symbol": "BTCUSDT",
            "list": [
                ["1670608920000", "17075", "17080", "17060", "17071", "3.5", "59748.5"],
                ["1670608860000", "17073", "17076", "17070", "17075", "1.25", "21341.2"],
                ["1670608800000", "17071", "17073", "17027", "17073", "2", "34142"]
            ]
        },
        "time": 1672025956592
    }"#;

    #[test]
    fn reverses_into_ascending_order() {
        let candles = BybitSource::parse_klines(BODY).unwrap();
        let ts: Vec<i64> = candles.iter().map(|c| c.timestamp).collect();
        assert_eq!(ts, vec![1_670_608_800_000, 1_670_608_860_000, 1_670_608_920_000]);
        assert_eq!(candles[1].volume, Decimal::new(125, 2));
    }

    #[test]
    fn nonzero_ret_code_is_exchange_error() {
        let body = r#"{"retCode":10001,"retMsg":"Not supported symbols","result":{}}"#;
        let err = BybitSource::parse_klines(body).unwrap_err();
        assert!(matches!(err, SourceError::Exchange { code: 10001, .. }));
        assert!(BybitSource::parse_error(body).is_some());
    }

    #[test]
    fn empty_list_is_no_data() {
        let body = r#"{"retCode":0,"retMsg":"OK","result":{"list":[]}}"#;
        assert!(BybitSource::parse_klines(body).unwrap().is_empty());
    }

    #[test]
    fn unsupported_timeframes() {
        assert_eq!(BybitSource::interval(Timeframe::H1), Some("60"));
        assert_eq!(BybitSource::interval(Timeframe::Month1), Some("M"));
        assert_eq!(BybitSource::interval(Timeframe::H8), None);
        assert_eq!(BybitSource::interval(Timeframe::D3), None);
    }

    const HOUR: i64 = 3_600_000;
    const LISTED: i64 = 1_609_459_200_000;

    /// Candle history answering like the kline endpoint: the latest `limit`
    /// candles inside `[start, end]`, ascending.
    struct Listing {
        timestamps: Vec<i64>,
        queries: Mutex<usize>,
    }

    impl Listing {
        fn new(timestamps: Vec<i64>) -> Self {
            Self {
                timestamps,
                queries: Mutex::new(0),
            }
        }

        fn query(&self, start: i64, end: i64, limit: usize) -> Vec<Candle> {
            *self.queries.lock().unwrap() += 1;
            let hits: Vec<i64> = self
                .timestamps
                .iter()
                .copied()
                .filter(|t| (start..=end).contains(t))
                .collect();
            let skip = hits.len().saturating_sub(limit);
            hits[skip..]
                .iter()
                .map(|&t| {
                    let one = Decimal::ONE;
                    Candle::new(t, one, one, one, one, one)
                })
                .collect()
        }

        fn first_page(&self, since: i64, limit: usize, now: i64) -> Vec<i64> {
            first_page_since(since, HOUR * limit as i64, limit, now, |start, end| {
                Ok(self.query(start, end, limit))
            })
            .unwrap()
            .iter()
            .map(|c| c.timestamp)
            .collect()
        }

        fn queries(&self) -> usize {
            *self.queries.lock().unwrap()
        }
    }

    fn hourly(from: i64, count: i64) -> Vec<i64> {
        (0..count).map(|i| from + i * HOUR).collect()
    }

    #[test]
    fn epoch_start_finds_the_listing() {
        let listing = Listing::new(hourly(LISTED, 500));
        let now = LISTED + 500 * HOUR;

        let page = listing.first_page(0, 100, now);

        // A complete prefix of the listing, however the search narrowed.
        assert!(!page.is_empty() && page.len() <= 100);
        assert_eq!(page, hourly(LISTED, page.len() as i64));
        assert!(listing.queries() < 64, "{} queries", listing.queries());
    }

    #[test]
    fn outage_wider_than_a_page_is_skipped() {
        let mut timestamps = hourly(LISTED, 50);
        let resumed = LISTED + 1_050 * HOUR;
        timestamps.extend(hourly(resumed, 300));
        let listing = Listing::new(timestamps);

        let page = listing.first_page(LISTED + 50 * HOUR, 100, resumed + 300 * HOUR);

        assert!(!page.is_empty() && page.len() <= 100);
        assert_eq!(page, hourly(resumed, page.len() as i64));
    }

    #[test]
    fn nothing_after_the_cursor_up_to_now() {
        let listing = Listing::new(hourly(LISTED, 10));
        let now = LISTED + 10_000 * HOUR;

        let page = listing.first_page(LISTED + 10 * HOUR, 100, now);

        assert!(page.is_empty());
        assert!(listing.queries() < 16, "{} queries", listing.queries());
    }

    /// Source with Bybit's windowing over a fixed listing.
    struct ListingSource {
        listing: Listing,
        now: i64,
    }

    impl CandleSource for ListingSource {
        fn name(&self) -> &str {
            "listing"
        }

        fn fetch_ohlcv(&self, request: &FetchRequest) -> Result<Vec<Candle>, SourceError> {
            let limit = request.limit as usize;
            first_page_since(request.since, HOUR * limit as i64, limit, self.now, |start, end| {
                Ok(self.listing.query(start, end, limit))
            })
        }
    }

    #[test]
    fn ingests_across_an_outage_from_the_epoch() {
        use crate::data::{
            download_series, FixedClock, IngestPlan, MemoryStore, NoProgress, RetryPolicy,
        };
        use std::sync::atomic::AtomicBool;

        let mut timestamps = hourly(LISTED, 120);
        timestamps.extend(hourly(LISTED + 2_000 * HOUR, 80));
        let now = LISTED + 2_080 * HOUR;
        let source = ListingSource {
            listing: Listing::new(timestamps.clone()),
            now,
        };
        let plan = IngestPlan {
            symbol: "BTC/USDT".into(),
            timeframe: Timeframe::H1,
            page_limit: 50,
            retry: RetryPolicy::new(1),
            start_cursor: 0,
        };
        let mut store = MemoryStore::new();
        let cancel = AtomicBool::new(false);

        download_series(&source, &mut store, &plan, &FixedClock(now), &cancel, &NoProgress)
            .unwrap();

        let stored: Vec<i64> = store.candles().iter().map(|c| c.timestamp).collect();
        assert_eq!(stored, timestamps);
    }

    #[test]
    fn unsupported_timeframe_fails_without_network() {
        let source = BybitSource::with_client(reqwest::blocking::Client::new(), "http://127.0.0.1:9");
        let request = FetchRequest::new("BTC/USDT", Timeframe::H8, 0, 10);
        let err = source.fetch_ohlcv(&request).unwrap_err();
        assert!(matches!(err, SourceError::UnsupportedTimeframe { .. }));
    }
}
