//! CSV schema contract: the fixed six-column shape of a persisted series.
//!
//! Defines the exact column names, their order, and the value encoding that the
//! store writes and every reader (resume, inspect, convert) expects.

use serde::{Deserialize, Serialize};

/// Value encoding of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaType {
    /// Integer milliseconds since the Unix epoch.
    EpochMillis,
    /// Decimal text, plain or scientific notation.
    Decimal,
}

/// A single column in the expected CSV schema.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaField {
    pub name: &'static str,
    pub dtype: SchemaType,
}

/// The canonical candle CSV schema.
///
/// - Columns: timestamp, open, high, low, close, volume (in this order)
/// - Encoding: UTF-8, comma separated, header row first
/// - Sort order: strictly ascending by timestamp, no duplicates
pub const CANDLE_SCHEMA: &[SchemaField] = &[
    SchemaField {
        name: "timestamp",
        dtype: SchemaType::EpochMillis,
    },
    SchemaField {
        name: "open",
        dtype: SchemaType::Decimal,
    },
    SchemaField {
        name: "high",
        dtype: SchemaType::Decimal,
    },
    SchemaField {
        name: "low",
        dtype: SchemaType::Decimal,
    },
    SchemaField {
        name: "close",
        dtype: SchemaType::Decimal,
    },
    SchemaField {
        name: "volume",
        dtype: SchemaType::Decimal,
    },
];

/// Column names in schema order, ready to write as a header record.
pub fn header() -> [&'static str; 6] {
    [
        CANDLE_SCHEMA[0].name,
        CANDLE_SCHEMA[1].name,
        CANDLE_SCHEMA[2].name,
        CANDLE_SCHEMA[3].name,
        CANDLE_SCHEMA[4].name,
        CANDLE_SCHEMA[5].name,
    ]
}

/// Result of header validation.
#[derive(Debug, Clone)]
pub struct SchemaValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

/// Validate a header row against the schema: same names, same order, nothing extra.
pub fn validate_header<S: AsRef<str>>(columns: &[S]) -> SchemaValidation {
    let mut errors = Vec::new();

    for (i, expected) in CANDLE_SCHEMA.iter().enumerate() {
        match columns.get(i).map(|c| c.as_ref().trim()) {
            Some(name) if name == expected.name => {}
            Some(name) => errors.push(format!(
                "column {i}: expected '{}', got '{name}'",
                expected.name
            )),
            None => errors.push(format!("missing required column '{}'", expected.name)),
        }
    }

    for extra in columns.iter().skip(CANDLE_SCHEMA.len()) {
        errors.push(format!(
            "unexpected column '{}' (not in schema)",
            extra.as_ref()
        ));
    }

    SchemaValidation {
        is_valid: errors.is_empty(),
        errors,
    }
}
