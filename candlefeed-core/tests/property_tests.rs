//! Property tests for ingestion invariants.
//!
//! Uses proptest to verify:
//! 1. Monotonic store: the stored series is strictly ascending and equals
//!    the exchange history up to the live edge
//! 2. Bounded loop: at most ceil(n / limit) + 1 fetches
//! 3. Idempotent resume: a second run appends nothing
//! 4. Split runs: a failed run plus a resume equals one uninterrupted run
//! 5. Boundary filter: nothing before the cursor is ever appended

use candlefeed_core::data::{
    download_series, BatchProgress, CandleSource, FetchRequest, FixedClock, IngestOutcome,
    IngestPlan, IngestProgress, MemoryStore, NoProgress, RetryPolicy, SourceError,
};
use candlefeed_core::domain::{Candle, Timeframe};
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::cell::RefCell;
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;

const MINUTE: i64 = 60_000;

struct Market {
    timestamps: Vec<i64>,
    overlap: bool,
    fail_after: Option<usize>,
    calls: Mutex<usize>,
}

impl Market {
    fn new(timestamps: Vec<i64>) -> Self {
        Self {
            timestamps,
            overlap: false,
            fail_after: None,
            calls: Mutex::new(0),
        }
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl CandleSource for Market {
    fn name(&self) -> &str {
        "market"
    }

    fn fetch_ohlcv(&self, request: &FetchRequest) -> Result<Vec<Candle>, SourceError> {
        let mut calls = self.calls.lock().unwrap();
        *calls += 1;
        if matches!(self.fail_after, Some(n) if *calls > n) {
            return Err(SourceError::NetworkUnreachable("connection reset".into()));
        }
        let mut start = self.timestamps.partition_point(|&t| t < request.since);
        if self.overlap {
            start = start.saturating_sub(1);
        }
        Ok(self.timestamps[start..]
            .iter()
            .take(request.limit as usize)
            .map(|&t| {
                let p = Decimal::new(t / MINUTE + 1, 0);
                Candle::new(t, p, p, p, p, Decimal::ONE)
            })
            .collect())
    }
}

fn plan(limit: u32) -> IngestPlan {
    IngestPlan {
        symbol: "BTC/USDT".into(),
        timeframe: Timeframe::M1,
        page_limit: limit,
        retry: RetryPolicy::new(1),
        start_cursor: 0,
    }
}

fn timestamps(store: &MemoryStore) -> Vec<i64> {
    store.candles().iter().map(|c| c.timestamp).collect()
}

// ── Strategies (proptest) ────────────────────────────────────────────

/// Ascending minute timestamps with random holes.
fn arb_history() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(1i64..5, 0..120).prop_map(|steps| {
        let mut t = 0;
        steps
            .into_iter()
            .map(|s| {
                t += s * MINUTE;
                t
            })
            .collect()
    })
}

// ── 1 + 2. Monotonic store, bounded loop ─────────────────────────────

proptest! {
    #[test]
    fn store_mirrors_history_within_fetch_bound(
        history in arb_history(),
        limit in 1u32..20,
    ) {
        let market = Market::new(history.clone());
        let mut store = MemoryStore::new();
        let cancel = AtomicBool::new(false);

        let summary = download_series(
            &market, &mut store, &plan(limit), &FixedClock(i64::MAX), &cancel, &NoProgress,
        ).unwrap();

        let stored = timestamps(&store);
        prop_assert!(stored.windows(2).all(|w| w[0] < w[1]));
        prop_assert_eq!(&stored, &history);

        let bound = history.len().div_ceil(limit as usize) + 1;
        prop_assert!(market.calls() <= bound, "{} calls > bound {}", market.calls(), bound);
        prop_assert_eq!(summary.outcome.fetches, market.calls());
    }

    #[test]
    fn live_edge_bounds_the_run(
        history in arb_history(),
        limit in 1u32..20,
        edge in 0i64..600,
    ) {
        let now = edge * MINUTE;
        let market = Market::new(history.clone());
        let mut store = MemoryStore::new();
        let cancel = AtomicBool::new(false);

        let summary = download_series(
            &market, &mut store, &plan(limit), &FixedClock(now), &cancel, &NoProgress,
        ).unwrap();

        // A cursor already at the edge issues no request.
        prop_assert_eq!(summary.outcome.fetches == 0, now == 0);
        let stored = timestamps(&store);
        prop_assert!(history.starts_with(&stored));
        let before_edge = history.iter().filter(|&&t| t < now).count();
        prop_assert!(stored.len() >= before_edge);
    }
}

// ── 3 + 4. Idempotent and split resume ───────────────────────────────

proptest! {
    #[test]
    fn second_run_is_a_no_op(history in arb_history(), limit in 1u32..20) {
        let market = Market::new(history);
        let mut store = MemoryStore::new();
        let cancel = AtomicBool::new(false);
        let clock = FixedClock(i64::MAX);

        download_series(&market, &mut store, &plan(limit), &clock, &cancel, &NoProgress).unwrap();
        let before = store.candles().to_vec();

        let summary =
            download_series(&market, &mut store, &plan(limit), &clock, &cancel, &NoProgress).unwrap();

        prop_assert_eq!(summary.outcome.appended, 0);
        prop_assert_eq!(store.candles(), &before[..]);
    }

    #[test]
    fn failed_run_plus_resume_equals_one_run(
        history in arb_history(),
        limit in 1u32..20,
        fail_after in 0usize..10,
    ) {
        let cancel = AtomicBool::new(false);
        let clock = FixedClock(i64::MAX);

        let mut whole = MemoryStore::new();
        download_series(
            &Market::new(history.clone()), &mut whole, &plan(limit), &clock, &cancel, &NoProgress,
        ).unwrap();

        let flaky = Market { fail_after: Some(fail_after), ..Market::new(history.clone()) };
        let mut split = MemoryStore::new();
        let _ = download_series(&flaky, &mut split, &plan(limit), &clock, &cancel, &NoProgress);
        download_series(
            &Market::new(history), &mut split, &plan(limit), &clock, &cancel, &NoProgress,
        ).unwrap();

        prop_assert_eq!(split.candles(), whole.candles());
    }
}

// ── 5. Boundary filter ───────────────────────────────────────────────

#[derive(Default)]
struct CursorLog {
    batches: RefCell<Vec<BatchProgress>>,
}

impl IngestProgress for CursorLog {
    fn on_batch(&self, progress: &BatchProgress) {
        self.batches.borrow_mut().push(*progress);
    }

    fn on_filtered(&self, _dropped: usize, _cursor: i64) {}

    fn on_finished(&self, _outcome: &IngestOutcome) {}
}

proptest! {
    #[test]
    fn overlapping_source_never_duplicates(history in arb_history(), limit in 2u32..20) {
        let market = Market { overlap: true, ..Market::new(history.clone()) };
        let mut store = MemoryStore::new();
        let cancel = AtomicBool::new(false);
        let log = CursorLog::default();

        let summary = download_series(
            &market, &mut store, &plan(limit), &FixedClock(i64::MAX), &cancel, &log,
        ).unwrap();

        prop_assert_eq!(timestamps(&store), history);
        // Each batch starts after the previous one ended.
        let batches = log.batches.borrow();
        for pair in batches.windows(2) {
            prop_assert!(pair[1].last_timestamp > pair[0].last_timestamp);
        }
        prop_assert_eq!(batches.last().map(|b| b.total).unwrap_or(0), summary.outcome.appended);
    }
}
