//! Incremental ingestion loop.
//!
//! A sequential state machine: fetch a page at the cursor, drop anything
//! before the cursor, append the rest, advance the cursor, repeat. It stops at
//! the live edge (the instant the run started), when the source has nothing
//! new, or when cancellation is requested. Whatever was appended before a stop
//! or an error stays on disk; the next run resumes from it.

use super::provider::{BatchProgress, CandleSource, Clock, FetchRequest, IngestProgress};
use super::retry::{FetchError, RetryingFetcher};
use super::store::{AppendStore, StoreError};
use crate::domain::{iso8601, next_cursor, Candle, CorruptSeriesError};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::debug;

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The cursor reached the instant the run started.
    LiveEdge,
    /// The source returned nothing at or after the cursor.
    Empty,
    /// Cancellation was requested.
    Cancelled,
}

/// Summary of one loop run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub stop: StopReason,
    /// Rows appended during this run.
    pub appended: usize,
    /// Candles discarded by the cursor filter.
    pub dropped: usize,
    /// Successful source fetches (retries not counted).
    pub fetches: usize,
    /// First timestamp appended during this run.
    pub first_timestamp: Option<i64>,
    /// Last timestamp appended during this run.
    pub last_timestamp: Option<i64>,
    /// Cursor the next run will resume from.
    pub cursor: i64,
}

/// Fatal ingestion errors.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("corrupt series: {0}")]
    CorruptSeries(#[from] CorruptSeriesError),

    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for IngestError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Corrupt(c) => IngestError::CorruptSeries(c),
            other => IngestError::Store(other),
        }
    }
}

enum State {
    Fetching,
    Filtering(Vec<Candle>),
    Appending(Vec<Candle>),
    Done(StopReason),
}

/// Drives fetch → filter → append cycles for one symbol/timeframe.
pub struct IngestionLoop<'a, S, St>
where
    S: CandleSource + ?Sized,
    St: AppendStore + ?Sized,
{
    fetcher: RetryingFetcher<'a, S>,
    store: &'a mut St,
    clock: &'a dyn Clock,
    cancel: &'a AtomicBool,
    progress: &'a dyn IngestProgress,
}

impl<'a, S, St> IngestionLoop<'a, S, St>
where
    S: CandleSource + ?Sized,
    St: AppendStore + ?Sized,
{
    pub fn new(
        fetcher: RetryingFetcher<'a, S>,
        store: &'a mut St,
        clock: &'a dyn Clock,
        cancel: &'a AtomicBool,
        progress: &'a dyn IngestProgress,
    ) -> Self {
        Self {
            fetcher,
            store,
            clock,
            cancel,
            progress,
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Run until a terminal state. `request.since` is the starting cursor.
    ///
    /// The live edge is sampled once here, so a long run always terminates
    /// even if the clock moves.
    pub fn run(&mut self, mut request: FetchRequest) -> Result<IngestOutcome, IngestError> {
        let now = self.clock.now_millis();
        let mut appended = 0usize;
        let mut dropped = 0usize;
        let mut fetches = 0usize;
        let mut first_timestamp = None;
        let mut last_timestamp = None;

        let mut state = State::Fetching;
        let stop = loop {
            state = match state {
                State::Fetching => {
                    if self.cancelled() {
                        State::Done(StopReason::Cancelled)
                    } else if request.since >= now {
                        State::Done(StopReason::LiveEdge)
                    } else {
                        let batch = self.fetcher.fetch(&request)?;
                        fetches += 1;
                        if self.cancelled() {
                            // Not yet durable; drop the whole page.
                            State::Done(StopReason::Cancelled)
                        } else {
                            State::Filtering(batch)
                        }
                    }
                }
                State::Filtering(mut batch) => {
                    let received = batch.len();
                    batch.retain(|c| c.timestamp >= request.since);
                    let discarded = received - batch.len();
                    if discarded > 0 {
                        dropped += discarded;
                        self.progress.on_filtered(discarded, request.since);
                    }
                    if batch.is_empty() {
                        debug!("no data received since {}", iso8601(request.since));
                        State::Done(StopReason::Empty)
                    } else {
                        State::Appending(batch)
                    }
                }
                State::Appending(batch) => {
                    let (first, last) = match (batch.first(), batch.last()) {
                        (Some(f), Some(l)) => (f.timestamp, l.timestamp),
                        _ => break StopReason::Empty,
                    };
                    // A batch that would leave the file unresumable is never written.
                    let next = next_cursor(last)?;
                    let written = self.store.append(&batch)?;
                    appended += written;
                    let run_first = *first_timestamp.get_or_insert(first);
                    last_timestamp = Some(last);
                    request.since = next;

                    self.progress.on_batch(&BatchProgress {
                        batch_len: written,
                        total: appended,
                        first_timestamp: run_first,
                        last_timestamp: last,
                    });

                    if request.since >= now {
                        State::Done(StopReason::LiveEdge)
                    } else {
                        State::Fetching
                    }
                }
                State::Done(reason) => break reason,
            };
        };

        let outcome = IngestOutcome {
            stop,
            appended,
            dropped,
            fetches,
            first_timestamp,
            last_timestamp,
            cursor: request.since,
        };
        self.progress.on_finished(&outcome);
        Ok(outcome)
    }
}
