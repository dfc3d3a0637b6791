//! Checkpoint resume: derive the next fetch cursor from the persisted series.
//!
//! There is no separate state file. The cursor is always recomputed from the
//! rows already on disk, and the series invariants are re-checked every time,
//! because the file may have been edited between runs.

use crate::domain::{next_cursor, CorruptSeriesError, Series};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointResolver {
    default_start: i64,
}

impl CheckpointResolver {
    /// `default_start` is the cursor used when nothing has been stored yet.
    pub fn new(default_start: i64) -> Self {
        Self { default_start }
    }

    /// Next cursor: one millisecond after the last stored candle, or the
    /// default start for an empty series.
    pub fn resolve(&self, series: &Series) -> Result<i64, CorruptSeriesError> {
        series.validate()?;
        match series.last_timestamp() {
            Some(last) => next_cursor(last),
            None => Ok(self.default_start),
        }
    }
}

impl Default for CheckpointResolver {
    fn default() -> Self {
        Self::new(0)
    }
}
