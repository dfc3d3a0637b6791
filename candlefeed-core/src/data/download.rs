//! Download orchestrator: bootstrap the store, resume from its last row, and
//! run the ingestion loop for one symbol/timeframe.

use super::checkpoint::CheckpointResolver;
use super::ingest::{IngestError, IngestOutcome, IngestionLoop};
use super::provider::{CandleSource, Clock, FetchRequest, IngestProgress};
use super::retry::{RetryPolicy, RetryingFetcher};
use super::store::AppendStore;
use crate::domain::{iso8601, Timeframe};
use std::sync::atomic::AtomicBool;
use tracing::info;

/// Everything the core needs to know about one ingestion run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestPlan {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub page_limit: u32,
    pub retry: RetryPolicy,
    /// Cursor used when the store holds no rows yet.
    pub start_cursor: i64,
}

/// Result of a download run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    /// Rows already in the store before this run.
    pub existing_rows: usize,
    /// Cursor the run resumed from.
    pub resumed_from: i64,
    pub outcome: IngestOutcome,
}

impl DownloadSummary {
    /// Rows in the store after this run.
    pub fn total_rows(&self) -> usize {
        self.existing_rows + self.outcome.appended
    }
}

/// Download a single series: bootstrap → read → resolve → ingest.
///
/// The existing series is validated before any network call is made.
pub fn download_series<S, St>(
    source: &S,
    store: &mut St,
    plan: &IngestPlan,
    clock: &dyn Clock,
    cancel: &AtomicBool,
    progress: &dyn IngestProgress,
) -> Result<DownloadSummary, IngestError>
where
    S: CandleSource + ?Sized,
    St: AppendStore + ?Sized,
{
    store.bootstrap()?;
    let series = store.read_all()?;
    let existing_rows = series.len();

    let resolver = CheckpointResolver::new(plan.start_cursor);
    let resumed_from = resolver.resolve(&series)?;
    drop(series);

    info!(
        source = source.name(),
        symbol = %plan.symbol,
        timeframe = %plan.timeframe,
        existing_rows,
        "fetching data since {} ({resumed_from})",
        iso8601(resumed_from)
    );

    let fetcher = RetryingFetcher::new(source, plan.retry);
    let request = FetchRequest::new(
        plan.symbol.clone(),
        plan.timeframe,
        resumed_from,
        plan.page_limit,
    );
    let outcome = IngestionLoop::new(fetcher, store, clock, cancel, progress).run(request)?;

    Ok(DownloadSummary {
        existing_rows,
        resumed_from,
        outcome,
    })
}
