// Error types shared across the pipeline

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::market::{BookSide, Instrument};
use crate::signal::PatternType;

/// Reasons a market event is refused at ingestion
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestError {
    #[error("non-positive volume {volume} for {instrument}")]
    NonPositiveVolume { instrument: Instrument, volume: i64 },

    #[error("non-positive price {price} for {instrument}")]
    NonPositivePrice { instrument: Instrument, price: f64 },

    #[error("timestamp {timestamp} for {instrument} is older than last accepted {last}")]
    NonMonotonicTimestamp {
        instrument: Instrument,
        timestamp: DateTime<Utc>,
        last: DateTime<Utc>,
    },

    #[error("empty {side} side in book for {instrument}")]
    EmptyBookSide { instrument: Instrument, side: BookSide },
}

impl IngestError {
    /// Stable label used as a counter key
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::NonPositiveVolume { .. } => "non_positive_volume",
            IngestError::NonPositivePrice { .. } => "non_positive_price",
            IngestError::NonMonotonicTimestamp { .. } => "non_monotonic_timestamp",
            IngestError::EmptyBookSide { .. } => "empty_book_side",
        }
    }
}

/// Failure inside a single detector evaluation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DetectorError {
    #[error("{detector}: non-finite value for {metric}")]
    NonFinite {
        detector: PatternType,
        metric: &'static str,
    },

    #[error("{detector}: {message}")]
    Internal { detector: PatternType, message: String },
}

/// Reference rate fetch failure
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("no reference rate available")]
    Unavailable,
}

/// Rejected configuration value
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid configuration value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
