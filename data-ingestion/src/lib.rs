//! Data ingestion boundaries
//!
//! Market events arrive as JSON lines (file replay or standard input); the
//! reference exchange rate comes from the central bank's PTAX series.

pub mod config;
pub mod connectors;

pub use config::{FeedConfig, IngestionConfig, ReferenceRateConfig};
pub use connectors::{
    run_rate_fetcher, BcbPtaxSource, FeedStats, JsonLinesFeed, JsonLinesReader, RateUpdate, ReferenceRateSource, StaticRateSource,
};
