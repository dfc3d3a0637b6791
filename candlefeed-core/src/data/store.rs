//! Append-only candle store.
//!
//! Layout: one UTF-8 CSV file per exchange/symbol/timeframe, header row
//! `timestamp,open,high,low,close,volume`, timestamps as integer milliseconds.
//!
//! Features:
//! - Explicit header bootstrap (new or empty file gets the header row)
//! - Batch-granular appends: a batch is written with a single `write_all` and
//!   synced; on failure the file is truncated back to its previous length
//! - A commit lock shared by clones of the store, so a forced exit can wait
//!   for an in-flight write and rollback to finish
//! - Full read-back with header and row validation
//! - No update or delete operations

use crate::domain::{parse_decimal, Candle, CorruptSeriesError, Series};
use crate::schema;
use rust_decimal::Decimal;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{error, info};

/// Errors from local persistence. Always fatal to the run.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("append to {} failed ({source}); truncating back to {len} bytes also failed: {rollback}", path.display())]
    RollbackFailed {
        path: PathBuf,
        len: u64,
        #[source]
        source: io::Error,
        rollback: io::Error,
    },

    #[error("store at {location} used before bootstrap()")]
    NotBootstrapped { location: String },

    #[error(transparent)]
    Corrupt(#[from] CorruptSeriesError),
}

/// Persisted series: header bootstrap, batch append, full read.
pub trait AppendStore {
    /// Make sure the store exists and starts with the header row.
    fn bootstrap(&mut self) -> Result<(), StoreError>;

    /// Durably persist `batch` after the existing rows. Returns rows written.
    fn append(&mut self, batch: &[Candle]) -> Result<usize, StoreError>;

    /// Read every stored candle in file order.
    fn read_all(&self) -> Result<Series, StoreError>;
}

/// Sink a batch is committed to: written, synced, or cut back.
trait Durable: Write {
    fn sync(&mut self) -> io::Result<()>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl Durable for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// CSV file store.
///
/// Clones share one commit lock; see [`CsvStore::commit_lock`].
#[derive(Debug, Clone)]
pub struct CsvStore {
    path: PathBuf,
    commit_lock: Arc<Mutex<()>>,
}

impl CsvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            commit_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock held for the whole write, sync, and rollback of a batch. Holding
    /// it guarantees no append is half-written.
    pub fn commit_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.commit_lock)
    }

    /// Write `rows` to `sink` and sync. On failure the sink is cut back to
    /// `prev_len`.
    fn commit<W: Durable>(&self, sink: &mut W, rows: &[u8], prev_len: u64) -> Result<(), StoreError> {
        let _guard = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let Err(source) = sink.write_all(rows).and_then(|_| sink.sync()) else {
            return Ok(());
        };
        match sink.truncate(prev_len) {
            Ok(()) => Err(self.io_error(source)),
            Err(rollback) => {
                error!(
                    path = %self.path.display(),
                    len = prev_len,
                    error = %rollback,
                    "rollback after failed append failed, file may hold a partial batch"
                );
                Err(StoreError::RollbackFailed {
                    path: self.path.clone(),
                    len: prev_len,
                    source,
                    rollback,
                })
            }
        }
    }

    fn io_error(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn csv_error(&self, e: csv::Error) -> StoreError {
        let reason = e.to_string();
        let line = e.position().map_or(0, |p| p.line());
        match e.into_kind() {
            csv::ErrorKind::Io(source) => self.io_error(source),
            _ => CorruptSeriesError::MalformedRow { line, reason }.into(),
        }
    }

    fn check_header(&self, record: &csv::StringRecord) -> Result<(), StoreError> {
        let columns: Vec<&str> = record.iter().collect();
        if schema::validate_header(&columns).is_valid {
            Ok(())
        } else {
            Err(CorruptSeriesError::MissingHeader {
                found: columns.join(","),
            }
            .into())
        }
    }

    /// Length of the file, or 0 if it does not exist yet.
    fn existing_len(&self) -> Result<u64, StoreError> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(self.io_error(e)),
        }
    }
}

impl AppendStore for CsvStore {
    fn bootstrap(&mut self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }

        if self.existing_len()? == 0 {
            info!(path = %self.path.display(), "creating new series file");
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| self.io_error(e))?;
            let mut line = schema::header().join(",");
            line.push('\n');
            file.write_all(line.as_bytes())
                .and_then(|_| file.sync_data())
                .map_err(|e| self.io_error(e))?;
            return Ok(());
        }

        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(&self.path)
            .map_err(|e| self.csv_error(e))?;
        let mut first = csv::StringRecord::new();
        rdr.read_record(&mut first).map_err(|e| self.csv_error(e))?;
        self.check_header(&first)
    }

    fn append(&mut self, batch: &[Candle]) -> Result<usize, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::with_capacity(batch.len() * 64));
        for c in batch {
            wtr.write_record([
                c.timestamp.to_string(),
                c.open.to_string(),
                c.high.to_string(),
                c.low.to_string(),
                c.close.to_string(),
                c.volume.to_string(),
            ])
            .map_err(|e| self.csv_error(e))?;
        }
        let mut rows = wtr.into_inner().map_err(|e| self.io_error(e.into_error()))?;

        let mut file = match OpenOptions::new().read(true).append(true).open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotBootstrapped {
                    location: self.path.display().to_string(),
                })
            }
            Err(e) => return Err(self.io_error(e)),
        };
        let prev_len = file.metadata().map_err(|e| self.io_error(e))?.len();
        if prev_len == 0 {
            return Err(StoreError::NotBootstrapped {
                location: self.path.display().to_string(),
            });
        }

        // A hand-edited file may lack the trailing newline.
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))
            .and_then(|_| file.read_exact(&mut last))
            .map_err(|e| self.io_error(e))?;
        if last[0] != b'\n' {
            rows.insert(0, b'\n');
        }

        self.commit(&mut file, &rows, prev_len)?;
        Ok(batch.len())
    }

    fn read_all(&self) -> Result<Series, StoreError> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(&self.path)
            .map_err(|e| self.csv_error(e))?;

        let headers = rdr.headers().map_err(|e| self.csv_error(e))?.clone();
        self.check_header(&headers)?;

        let mut candles = Vec::new();
        for result in rdr.records() {
            let record = result.map_err(|e| self.csv_error(e))?;
            let line = record.position().map_or(0, |p| p.line());
            let candle = parse_record(&record)
                .map_err(|reason| CorruptSeriesError::MalformedRow { line, reason })?;
            candles.push(candle);
        }

        Ok(Series::new(candles))
    }
}

/// Parse one data row into a candle.
fn parse_record(record: &csv::StringRecord) -> Result<Candle, String> {
    if record.len() != schema::CANDLE_SCHEMA.len() {
        return Err(format!(
            "expected {} fields, found {}",
            schema::CANDLE_SCHEMA.len(),
            record.len()
        ));
    }

    let timestamp = record[0]
        .parse::<i64>()
        .map_err(|e| format!("timestamp '{}': {e}", &record[0]))?;

    let field = |i: usize| -> Result<Decimal, String> {
        parse_decimal(&record[i])
            .ok_or_else(|| format!("{} '{}' is not a decimal", schema::CANDLE_SCHEMA[i].name, &record[i]))
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

/// In-memory store with the same contract as [`CsvStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    bootstrapped: bool,
    candles: Vec<Candle>,
    appends: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of non-empty append calls so far.
    pub fn append_count(&self) -> usize {
        self.appends
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }
}

impl AppendStore for MemoryStore {
    fn bootstrap(&mut self) -> Result<(), StoreError> {
        self.bootstrapped = true;
        Ok(())
    }

    fn append(&mut self, batch: &[Candle]) -> Result<usize, StoreError> {
        if !self.bootstrapped {
            return Err(StoreError::NotBootstrapped {
                location: "memory".into(),
            });
        }
        if batch.is_empty() {
            return Ok(0);
        }
        self.candles.extend_from_slice(batch);
        self.appends += 1;
        Ok(batch.len())
    }

    fn read_all(&self) -> Result<Series, StoreError> {
        if !self.bootstrapped {
            return Err(StoreError::NotBootstrapped {
                location: "memory".into(),
            });
        }
        Ok(Series::new(self.candles.clone()))
    }
}
