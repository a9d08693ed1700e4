//! Pattern detector bank
//!
//! Detectors are a closed set built once from configuration. Each one is a
//! pure function of a market snapshot (plus the calculated-market snapshot)
//! producing at most one candidate per instrument. A failing detector is
//! reported and skipped for the cycle; the others still run.

mod book;
mod calculated;
mod flow;
mod footprint;
mod momentum;
mod trap;

pub use book::{BookPullingDetector, BookStackingDetector, FlashOrderDetector, ImbalanceShiftDetector};
pub use calculated::CalculatedLevelDetector;
pub use flow::{PaceAnomalyDetector, PressureDetector, VolumeSpikeDetector};
pub use footprint::{
    AbsorptionDetector, HiddenLiquidityDetector, IcebergDetector, InstitutionalFootprintDetector,
};
pub use momentum::{
    DivergenceDetector, MomentumExtremeDetector, MultiframeConfluenceDetector,
    MultiframeDivergenceDetector,
};
pub use trap::TrapDetector;

use common::{DetectorError, Instrument, PatternSignal, PatternType, SignalDirection};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::calculated_market::CalculatedSnapshot;
use crate::config::DetectorConfig;
use crate::market_state::{InstrumentSnapshot, MarketSnapshot};

/// Everything a detector may look at in one cycle
#[derive(Debug, Clone, Copy)]
pub struct DetectionContext<'a> {
    pub market: &'a MarketSnapshot,
    pub calculated: Option<&'a CalculatedSnapshot>,
}

impl<'a> DetectionContext<'a> {
    pub fn instrument(&self, instrument: Instrument) -> &'a InstrumentSnapshot {
        self.market.instrument(instrument)
    }
}

pub type DetectionResult = Result<Option<PatternSignal>, DetectorError>;

/// Closed set of detectors
#[derive(Debug, Clone)]
pub enum Detector {
    Absorption(AbsorptionDetector),
    Iceberg(IcebergDetector),
    Divergence(DivergenceDetector),
    MomentumExtreme(MomentumExtremeDetector),
    Pressure(PressureDetector),
    VolumeSpike(VolumeSpikeDetector),
    PaceAnomaly(PaceAnomalyDetector),
    BookPulling(BookPullingDetector),
    BookStacking(BookStackingDetector),
    FlashOrder(FlashOrderDetector),
    ImbalanceShift(ImbalanceShiftDetector),
    InstitutionalFootprint(InstitutionalFootprintDetector),
    HiddenLiquidity(HiddenLiquidityDetector),
    MultiframeDivergence(MultiframeDivergenceDetector),
    MultiframeConfluence(MultiframeConfluenceDetector),
    Trap(TrapDetector),
    CalculatedLevels(CalculatedLevelDetector),
    /// Panics on every evaluation
    #[cfg(test)]
    Panicking(PatternType),
}

impl Detector {
    /// Pattern this detector is reported under
    pub fn pattern(&self) -> PatternType {
        match self {
            Detector::Absorption(_) => PatternType::Absorption,
            Detector::Iceberg(_) => PatternType::Iceberg,
            Detector::Divergence(_) => PatternType::Divergence,
            Detector::MomentumExtreme(_) => PatternType::MomentumExtreme,
            Detector::Pressure(_) => PatternType::Pressure,
            Detector::VolumeSpike(_) => PatternType::VolumeSpike,
            Detector::PaceAnomaly(_) => PatternType::PaceAnomaly,
            Detector::BookPulling(_) => PatternType::BookPulling,
            Detector::BookStacking(_) => PatternType::BookStacking,
            Detector::FlashOrder(_) => PatternType::FlashOrder,
            Detector::ImbalanceShift(_) => PatternType::ImbalanceShift,
            Detector::InstitutionalFootprint(_) => PatternType::InstitutionalFootprint,
            Detector::HiddenLiquidity(_) => PatternType::HiddenLiquidity,
            Detector::MultiframeDivergence(_) => PatternType::MultiframeDivergence,
            Detector::MultiframeConfluence(_) => PatternType::MultiframeConfluence,
            Detector::Trap(_) => PatternType::Trap,
            // emits both calculated divergence and confluence
            Detector::CalculatedLevels(_) => PatternType::CalculatedConfluence,
            #[cfg(test)]
            Detector::Panicking(pattern) => *pattern,
        }
    }

    pub fn evaluate(&self, ctx: &DetectionContext<'_>, instrument: Instrument) -> DetectionResult {
        let snapshot = ctx.instrument(instrument);
        match self {
            Detector::Absorption(d) => d.detect(snapshot, ctx.market.timestamp),
            Detector::Iceberg(d) => d.detect(snapshot, ctx.market.timestamp),
            Detector::Divergence(d) => d.detect(snapshot, ctx.market.timestamp),
            Detector::MomentumExtreme(d) => d.detect(snapshot, ctx.market.timestamp),
            Detector::Pressure(d) => d.detect(snapshot, ctx.market.timestamp),
            Detector::VolumeSpike(d) => d.detect(snapshot, ctx.market.timestamp),
            Detector::PaceAnomaly(d) => d.detect(snapshot, ctx.market.timestamp),
            Detector::BookPulling(d) => d.detect(snapshot, ctx.market.timestamp),
            Detector::BookStacking(d) => d.detect(snapshot, ctx.market.timestamp),
            Detector::FlashOrder(d) => d.detect(snapshot, ctx.market.timestamp),
            Detector::ImbalanceShift(d) => d.detect(snapshot, ctx.market.timestamp),
            Detector::InstitutionalFootprint(d) => d.detect(snapshot, ctx.market.timestamp),
            Detector::HiddenLiquidity(d) => d.detect(snapshot, ctx.market.timestamp),
            Detector::MultiframeDivergence(d) => d.detect(snapshot, ctx.market.timestamp),
            Detector::MultiframeConfluence(d) => d.detect(snapshot, ctx.market.timestamp),
            Detector::Trap(d) => d.detect(snapshot, ctx.market.timestamp),
            Detector::CalculatedLevels(d) => d.detect(ctx, instrument),
            #[cfg(test)]
            Detector::Panicking(pattern) => panic!("{} detector failed on {}", pattern, instrument),
        }
    }
}

/// A detector that failed during one cycle
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorFault {
    pub detector: PatternType,
    pub instrument: Option<Instrument>,
    pub message: String,
}

/// Merged output of one bank evaluation
#[derive(Debug, Default)]
pub struct BankOutput {
    pub signals: Vec<PatternSignal>,
    pub faults: Vec<DetectorFault>,
}

/// Detector results for one detector, instrument order
type DetectorOutcome = Vec<(Instrument, DetectionResult)>;

pub struct PatternDetectorBank {
    detectors: Vec<Detector>,
}

impl PatternDetectorBank {
    pub fn new() -> Self {
        Self {
            detectors: Vec::new(),
        }
    }

    /// Add a detector
    pub fn add_detector(mut self, detector: Detector) -> Self {
        debug!("Adding detector: {:?}", detector.pattern());
        self.detectors.push(detector);
        self
    }

    /// Build every enabled detector
    pub fn from_config(config: &DetectorConfig) -> Self {
        let mut bank = Self::new();
        let enabled = [
            (config.absorption.enabled, Detector::Absorption(AbsorptionDetector::new(config.absorption.clone()))),
            (config.iceberg.enabled, Detector::Iceberg(IcebergDetector::new(config.iceberg.clone()))),
            (config.divergence.enabled, Detector::Divergence(DivergenceDetector::new(config.divergence.clone()))),
            (
                config.momentum.enabled,
                Detector::MomentumExtreme(MomentumExtremeDetector::new(
                    config.momentum.clone(),
                    config.divergence.clone(),
                )),
            ),
            (config.pressure.enabled, Detector::Pressure(PressureDetector::new(config.pressure.clone()))),
            (
                config.volume_spike.enabled,
                Detector::VolumeSpike(VolumeSpikeDetector::new(config.volume_spike.clone())),
            ),
            (config.pace.enabled, Detector::PaceAnomaly(PaceAnomalyDetector::new(config.pace.clone()))),
            (config.book.pulling_enabled, Detector::BookPulling(BookPullingDetector::new(config.book.clone()))),
            (config.book.stacking_enabled, Detector::BookStacking(BookStackingDetector::new(config.book.clone()))),
            (config.book.flash_enabled, Detector::FlashOrder(FlashOrderDetector::new(config.book.clone()))),
            (
                config.book.imbalance_enabled,
                Detector::ImbalanceShift(ImbalanceShiftDetector::new(config.book.clone())),
            ),
            (
                config.institutional.enabled,
                Detector::InstitutionalFootprint(InstitutionalFootprintDetector::new(config.institutional.clone())),
            ),
            (
                config.hidden_liquidity.enabled,
                Detector::HiddenLiquidity(HiddenLiquidityDetector::new(config.hidden_liquidity.clone())),
            ),
            (
                config.multiframe.divergence_enabled,
                Detector::MultiframeDivergence(MultiframeDivergenceDetector::new(config.multiframe.clone())),
            ),
            (
                config.multiframe.confluence_enabled,
                Detector::MultiframeConfluence(MultiframeConfluenceDetector::new(config.multiframe.clone())),
            ),
            (config.trap.enabled, Detector::Trap(TrapDetector::new(config.trap.clone()))),
            (
                config.calculated.enabled,
                Detector::CalculatedLevels(CalculatedLevelDetector::new(config.calculated.clone())),
            ),
        ];

        for (on, detector) in enabled {
            if on {
                bank = bank.add_detector(detector);
            }
        }
        bank
    }

    pub fn detector_count(&self) -> usize {
        self.detectors.len()
    }

    pub fn detectors(&self) -> &[Detector] {
        &self.detectors
    }

    /// Evaluate every detector inline, detector order then instrument order
    pub fn evaluate(&self, ctx: &DetectionContext<'_>) -> BankOutput {
        let outcomes = self
            .detectors
            .iter()
            .map(|detector| run_guarded(detector, ctx))
            .collect();
        self.merge(outcomes)
    }

    /// Evaluate detectors on blocking workers and merge in detector order
    pub async fn evaluate_parallel(
        self: &Arc<Self>,
        market: Arc<MarketSnapshot>,
        calculated: Option<CalculatedSnapshot>,
    ) -> BankOutput {
        let calculated = calculated.map(Arc::new);
        let mut tasks = JoinSet::new();

        for index in 0..self.detectors.len() {
            let bank = Arc::clone(self);
            let market = Arc::clone(&market);
            let calculated = calculated.clone();
            tasks.spawn_blocking(move || {
                let ctx = DetectionContext {
                    market: &market,
                    calculated: calculated.as_deref(),
                };
                (index, run_guarded(&bank.detectors[index], &ctx))
            });
        }

        // a slot never filled means its worker was lost
        let mut slots: Vec<Option<Result<DetectorOutcome, String>>> = vec![None; self.detectors.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(e) => warn!("Detector worker failed to join: {}", e),
            }
        }

        let outcomes = slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err("detector worker lost".to_string())))
            .collect();
        self.merge(outcomes)
    }

    fn merge(&self, outcomes: Vec<Result<DetectorOutcome, String>>) -> BankOutput {
        let mut output = BankOutput::default();
        for (detector, outcome) in self.detectors.iter().zip(outcomes) {
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(message) => {
                    warn!(detector = %detector.pattern(), "Detector worker failed: {}", message);
                    output.faults.push(DetectorFault {
                        detector: detector.pattern(),
                        instrument: None,
                        message,
                    });
                    continue;
                }
            };

            for (instrument, result) in outcome {
                match result {
                    Ok(Some(signal)) if signal.direction == SignalDirection::Neutral => {
                        debug!(pattern = %signal.pattern, instrument = %instrument, "Dropping candidate without direction");
                    }
                    Ok(Some(signal)) => {
                        debug!(
                            pattern = %signal.pattern,
                            instrument = %signal.instrument,
                            direction = ?signal.direction,
                            "Detector produced candidate"
                        );
                        output.signals.push(signal);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(detector = %detector.pattern(), instrument = %instrument, "Detector fault, skipping this cycle: {}", e);
                        output.faults.push(DetectorFault {
                            detector: detector.pattern(),
                            instrument: Some(instrument),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }
        output
    }
}

impl Default for PatternDetectorBank {
    fn default() -> Self {
        Self::new()
    }
}

fn run_detector(detector: &Detector, ctx: &DetectionContext<'_>) -> DetectorOutcome {
    Instrument::ALL
        .iter()
        .map(|instrument| (*instrument, detector.evaluate(ctx, *instrument)))
        .collect()
}

/// `run_detector` with a panic turned into a fault
fn run_guarded(detector: &Detector, ctx: &DetectionContext<'_>) -> Result<DetectorOutcome, String> {
    catch_unwind(AssertUnwindSafe(|| run_detector(detector, ctx))).map_err(|payload| {
        let reason = payload
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| payload.downcast_ref::<&str>().copied())
            .unwrap_or("unknown cause");
        format!("detector panicked: {}", reason)
    })
}

/// Key grouping trades at the same price
pub(crate) fn price_key(price: f64) -> i64 {
    (price * 10_000.0).round() as i64
}

pub(crate) fn ensure_finite(detector: PatternType, metric: &'static str, value: f64) -> Result<f64, DetectorError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(DetectorError::NonFinite { detector, metric })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::MarketStateConfig;
    use crate::market_state::RollingMarketState;
    use chrono::{DateTime, TimeZone, Utc};
    use common::{BookLevel, BookSnapshot, Side, Trade};

    pub fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    pub fn ts_ms(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + millis).unwrap()
    }

    pub fn create_test_trade(secs: i64, side: Side, price: f64, volume: i64) -> Trade {
        Trade::new(ts(secs), Instrument::Wdo, side, price, volume)
    }

    pub fn create_test_book(millis: i64, bids: &[(f64, i64)], asks: &[(f64, i64)]) -> BookSnapshot {
        BookSnapshot {
            timestamp: ts_ms(millis),
            instrument: Instrument::Wdo,
            bids: bids.iter().map(|(p, v)| BookLevel::new(*p, *v)).collect(),
            asks: asks.iter().map(|(p, v)| BookLevel::new(*p, *v)).collect(),
        }
    }

    pub fn create_test_state() -> RollingMarketState {
        RollingMarketState::new(MarketStateConfig::default())
    }

    /// Snapshot holding the given WDO trades
    pub fn snapshot_with_trades(trades: Vec<Trade>) -> MarketSnapshot {
        let mut state = create_test_state();
        for trade in trades {
            state.append_trade(trade).unwrap();
        }
        state.snapshot()
    }

    pub fn snapshot_with_books(books: Vec<BookSnapshot>) -> MarketSnapshot {
        let mut state = create_test_state();
        for book in books {
            state.append_book(book).unwrap();
        }
        state.snapshot()
    }
}
