//! Calendar-datetime export of a stored series.
//!
//! Rewrites the epoch-millisecond `timestamp` column as `YYYY-MM-DD HH:MM:SS`
//! (UTC) for tools that ingest daily/minute bars by date, e.g. zipline bundles.
//! The source file is read through the store so its invariants are checked.

use super::store::{AppendStore, CsvStore, StoreError};
use crate::domain::{Candle, Series};
use crate::schema;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("refusing to overwrite the input file {}", .0.display())]
    SameFile(PathBuf),

    #[error("timestamp {0} cannot be represented as a calendar datetime")]
    TimestampOutOfRange(i64),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("csv write failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Render one candle as a datetime-keyed CSV record.
fn datetime_record(candle: &Candle) -> Result<[String; 6], ConvertError> {
    let dt = candle
        .datetime()
        .ok_or(ConvertError::TimestampOutOfRange(candle.timestamp))?;
    Ok([
        dt.format(DATETIME_FORMAT).to_string(),
        candle.open.to_string(),
        candle.high.to_string(),
        candle.low.to_string(),
        candle.close.to_string(),
        candle.volume.to_string(),
    ])
}

/// Serialise a series with calendar datetimes to CSV text.
pub fn to_datetime_csv(series: &Series) -> Result<String, ConvertError> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(schema::header())?;
    for candle in series.candles() {
        wtr.write_record(datetime_record(candle)?)?;
    }
    let data = wtr.into_inner().map_err(|e| e.into_error())?;
    String::from_utf8(data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e).into())
}

/// Read `input`, convert, and write `output`. Returns the converted series.
pub fn convert_to_datetime_csv(input: &Path, output: &Path) -> Result<Series, ConvertError> {
    if same_file(input, output) {
        return Err(ConvertError::SameFile(output.to_path_buf()));
    }

    let series = CsvStore::new(input).read_all()?;
    series
        .validate()
        .map_err(|e| ConvertError::Store(StoreError::Corrupt(e)))?;

    let text = to_datetime_csv(&series)?;
    let tmp = output.with_extension("csv.tmp");
    fs::write(&tmp, text)?;
    if let Err(e) = fs::rename(&tmp, output) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(series)
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const INPUT: &str = "timestamp,open,high,low,close,volume\n\
                         1704067200000,42000.5,42100,41900,42050,12.5\n\
                         1704070800000,42050,42200,42000,42150,8\n";

    #[test]
    fn converts_timestamps_to_datetimes() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.csv");
        let output = dir.path().join("out.csv");
        fs::write(&input, INPUT).unwrap();

        let series = convert_to_datetime_csv(&input, &output).unwrap();
        assert_eq!(series.len(), 2);

        let text = fs::read_to_string(&output).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "timestamp,open,high,low,close,volume");
        assert_eq!(lines[1], "2024-01-01 00:00:00,42000.5,42100,41900,42050,12.5");
        assert_eq!(lines[2], "2024-01-01 01:00:00,42050,42200,42000,42150,8");
        assert!(!output.with_extension("csv.tmp").exists());
    }

    #[test]
    fn refuses_to_overwrite_input() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.csv");
        fs::write(&input, INPUT).unwrap();

        let err = convert_to_datetime_csv(&input, &input).unwrap_err();
        assert!(matches!(err, ConvertError::SameFile(_)));
        assert_eq!(fs::read_to_string(&input).unwrap(), INPUT);
    }

    #[test]
    fn rejects_corrupt_input() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.csv");
        let output = dir.path().join("out.csv");
        fs::write(
            &input,
            "timestamp,open,high,low,close,volume\n2,1,1,1,1,1\n1,1,1,1,1,1\n",
        )
        .unwrap();

        let err = convert_to_datetime_csv(&input, &output).unwrap_err();
        assert!(matches!(err, ConvertError::Store(StoreError::Corrupt(_))));
        assert!(!output.exists());
    }
}
