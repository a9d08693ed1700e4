pub mod feed;
pub mod ptax;

pub use feed::{FeedStats, JsonLinesFeed, JsonLinesReader};
pub use ptax::{run_rate_fetcher, BcbPtaxSource, RateUpdate, ReferenceRateSource, StaticRateSource};
