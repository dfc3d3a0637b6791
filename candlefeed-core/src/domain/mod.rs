//! Domain types for candlefeed

pub mod candle;
pub mod series;
pub mod timeframe;

pub use candle::{iso8601, parse_decimal, Candle};
pub use series::{next_cursor, CorruptSeriesError, Gap, Series};
pub use timeframe::{Timeframe, UnknownTimeframe};

/// Symbol type alias (unified `BASE/QUOTE` form, e.g. `BTC/USDT`)
pub type Symbol = String;
