//! Candlefeed Core: incremental OHLCV ingestion into an append-only CSV store.
//!
//! - Domain types (candles, timeframes, validated series)
//! - Exchange sources behind the `CandleSource` trait (Binance, Bybit)
//! - Bounded retry, checkpoint resume, and the fetch/filter/append loop
//! - CSV store with rollback of partial appends
//! - TOML job configuration

pub mod config;
pub mod data;
pub mod domain;
pub mod schema;
