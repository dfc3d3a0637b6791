//! Series: an ordered run of candles as read back from the store.

use super::candle::Candle;
use super::timeframe::Timeframe;
use thiserror::Error;

/// The persisted series violates one of its invariants.
///
/// Never repaired automatically: rewriting the file could lose data, so the
/// run stops and the operator decides.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CorruptSeriesError {
    #[error("duplicate timestamp {timestamp} at row {index}")]
    Duplicate { index: usize, timestamp: i64 },

    #[error("timestamps out of order at row {index}: {current} follows {previous}")]
    OutOfOrder {
        index: usize,
        previous: i64,
        current: i64,
    },

    #[error("missing or unexpected header row: found '{found}'")]
    MissingHeader { found: String },

    #[error("malformed row at line {line}: {reason}")]
    MalformedRow { line: u64, reason: String },

    #[error("timestamp {timestamp} leaves no room for a later candle")]
    TimestampOverflow { timestamp: i64 },
}

/// Cursor for the candle after `last`: one millisecond later.
pub fn next_cursor(last: i64) -> Result<i64, CorruptSeriesError> {
    last.checked_add(1)
        .ok_or(CorruptSeriesError::TimestampOverflow { timestamp: last })
}

/// A hole between two consecutive candles wider than one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    /// Timestamp of the candle before the hole.
    pub after: i64,
    /// Timestamp of the candle after the hole.
    pub before: i64,
    /// Number of buckets missing between the two.
    pub missing: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Series {
    candles: Vec<Candle>,
}

impl Series {
    pub fn new(candles: Vec<Candle>) -> Self {
        Self { candles }
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn first_timestamp(&self) -> Option<i64> {
        self.candles.first().map(|c| c.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<i64> {
        self.candles.last().map(|c| c.timestamp)
    }

    /// Check that timestamps are unique and strictly increasing.
    ///
    /// Reports the first offending row (0-based data row index).
    pub fn validate(&self) -> Result<(), CorruptSeriesError> {
        for (i, pair) in self.candles.windows(2).enumerate() {
            let (previous, current) = (pair[0].timestamp, pair[1].timestamp);
            if current == previous {
                return Err(CorruptSeriesError::Duplicate {
                    index: i + 1,
                    timestamp: current,
                });
            }
            if current < previous {
                return Err(CorruptSeriesError::OutOfOrder {
                    index: i + 1,
                    previous,
                    current,
                });
            }
        }
        Ok(())
    }

    /// Holes wider than one `timeframe` bucket between consecutive candles.
    ///
    /// Timeframes without a fixed duration (calendar months) report nothing.
    pub fn gaps(&self, timeframe: Timeframe) -> Vec<Gap> {
        let Some(step) = timeframe.duration_ms() else {
            return Vec::new();
        };
        self.candles
            .windows(2)
            .filter_map(|pair| {
                let (after, before) = (pair[0].timestamp, pair[1].timestamp);
                let delta = before - after;
                (delta > step).then(|| Gap {
                    after,
                    before,
                    missing: delta / step - 1,
                })
            })
            .collect()
    }
}

impl From<Vec<Candle>> for Series {
    fn from(candles: Vec<Candle>) -> Self {
        Self::new(candles)
    }
}
