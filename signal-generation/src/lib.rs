// Signal Generation (tape reading)
// Rolling market state, pattern detectors and the admission pipeline in front of the risk gate

pub mod calculated_market;
pub mod config;
pub mod confirmation;
pub mod cooldown;
pub mod detectors;
pub mod emitter;
pub mod manipulation;
pub mod market_state;
pub mod pipeline;

pub use calculated_market::{
    CalculatedMarketModule, CalculatedSnapshot, FairValueLadder, ForwardPointsPricing, LadderLevel,
    LevelKind, PivotPricing, StopTarget,
};
pub use config::SignalConfig;
pub use confirmation::{ConfirmationTracker, PendingRejection, PendingState, Resolution, TrackerStats};
pub use cooldown::CooldownRegistry;
pub use detectors::{BankOutput, DetectionContext, Detector, DetectorFault, PatternDetectorBank};
pub use emitter::{ChannelSink, InMemorySink, SignalSink, SinkStats};
pub use manipulation::{FilterOutcome, ManipulationFilter, ManipulationFlag};
pub use market_state::{CvdState, IngestStats, InstrumentSnapshot, MarketSnapshot, RollingMarketState};
pub use pipeline::{ConfirmationOutput, CycleOutput, PipelineStats, SignalPipeline};
