//! Shared types for the tape signal engine
//!
//! Market data records, the pattern signal model and the observability
//! events exchanged between ingestion, signal generation and risk.

mod error;
mod events;
mod market;
mod signal;

pub use error::{ConfigError, DetectorError, FetchError, IngestError};
pub use events::{
    ConfirmationOutcome, FilterAction, ManipulationKind, ObservabilityEvent, SuppressionReason,
};
pub use market::{BookLevel, BookSide, BookSnapshot, Instrument, MarketEvent, Side, Trade};
pub use signal::{PatternSignal, PatternType, SignalDirection, SignalSource};

pub use uuid::Uuid;
