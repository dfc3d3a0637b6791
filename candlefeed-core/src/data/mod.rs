//! Candle ingestion: exchange sources, retry, resume, and the append-only store.

pub mod binance;
pub mod bybit;
pub mod checkpoint;
pub mod convert;
pub mod download;
pub mod exchange;
pub mod ingest;
pub mod provider;
pub mod retry;
pub mod store;

pub use checkpoint::CheckpointResolver;
pub use convert::{convert_to_datetime_csv, ConvertError};
pub use download::{download_series, DownloadSummary, IngestPlan};
pub use exchange::{ExchangeKind, UnknownExchange};
pub use ingest::{IngestError, IngestOutcome, IngestionLoop, StopReason};
pub use provider::{
    BatchProgress, CandleSource, Clock, FetchRequest, FixedClock, IngestProgress, NoProgress,
    SourceError, SystemClock, TracingProgress,
};
pub use retry::{Backoff, FetchError, RetryPolicy, RetryingFetcher};
pub use store::{AppendStore, CsvStore, MemoryStore, StoreError};
