// Signal admission pipeline
// Detection -> manipulation filter -> cooldown -> confirmation or straight to risk

use chrono::{DateTime, Utc};
use common::{
    ConfigError, FetchError, ObservabilityEvent, PatternSignal, SuppressionReason,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::calculated_market::CalculatedMarketModule;
use crate::config::{PipelineConfig, SignalConfig};
use crate::confirmation::{ConfirmationTracker, TrackerStats};
use crate::cooldown::CooldownRegistry;
use crate::detectors::{BankOutput, DetectionContext, PatternDetectorBank};
use crate::manipulation::ManipulationFilter;
use crate::market_state::MarketSnapshot;

/// Everything one admission cycle produced
#[derive(Debug, Default)]
pub struct CycleOutput {
    /// Candidates that skip confirmation, in detector order
    pub ready: Vec<PatternSignal>,
    pub admitted_pending: usize,
    pub events: Vec<ObservabilityEvent>,
}

/// Confirmed signals and resolution events from one confirmation check
#[derive(Debug, Default)]
pub struct ConfirmationOutput {
    pub confirmed: Vec<PatternSignal>,
    pub events: Vec<ObservabilityEvent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    pub cycles: u64,
    pub candidates: u64,
    pub detector_faults: u64,
    pub manipulation_blocked: u64,
    pub cooldown_suppressed: u64,
    pub pending_rejected: u64,
    pub forwarded: u64,
    pub confirmation: TrackerStats,
}

/// Signal admission pipeline
pub struct SignalPipeline {
    bank: Arc<PatternDetectorBank>,
    filter: ManipulationFilter,
    cooldowns: CooldownRegistry,
    tracker: ConfirmationTracker,
    calculated: CalculatedMarketModule,
    config: PipelineConfig,
    stats: PipelineStats,
}

impl SignalPipeline {
    /// Validate the configuration and build every stage from it
    pub fn new(config: &SignalConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            bank: Arc::new(PatternDetectorBank::from_config(&config.detectors)),
            filter: ManipulationFilter::new(config.manipulation.clone()),
            cooldowns: CooldownRegistry::new(&config.cooldowns),
            tracker: ConfirmationTracker::new(config.confirmation.clone()),
            calculated: CalculatedMarketModule::new(config.calculated.clone()),
            config: config.pipeline.clone(),
            stats: PipelineStats::default(),
        })
    }

    /// Replace the detector bank
    pub fn with_bank(mut self, bank: PatternDetectorBank) -> Self {
        info!("Using custom detector bank with {} detectors", bank.detector_count());
        self.bank = Arc::new(bank);
        self
    }

    /// Replace the calculated-market module, e.g. with custom pivot pricing
    pub fn with_calculated(mut self, calculated: CalculatedMarketModule) -> Self {
        self.calculated = calculated;
        self
    }

    /// Run one admission cycle against `market`, using its timestamp as now
    pub async fn process(&mut self, market: Arc<MarketSnapshot>) -> CycleOutput {
        let mut output = CycleOutput::default();
        if !self.config.enabled {
            debug!("Pipeline is disabled, skipping admission cycle");
            return output;
        }
        if !market.has_data() {
            return output;
        }

        let now = market.timestamp;
        self.stats.cycles += 1;

        let calculated = self.calculated.snapshot(now);
        let bank_output = if self.config.parallel_detectors {
            self.bank.evaluate_parallel(Arc::clone(&market), calculated).await
        } else {
            let ctx = DetectionContext {
                market: &market,
                calculated: calculated.as_ref(),
            };
            self.bank.evaluate(&ctx)
        };
        let BankOutput { signals, faults } = bank_output;

        self.stats.candidates += signals.len() as u64;
        self.stats.detector_faults += faults.len() as u64;
        output.events.extend(faults.into_iter().map(|fault| ObservabilityEvent::DetectorFault {
            timestamp: now,
            detector: fault.detector,
            instrument: fault.instrument,
            message: fault.message,
        }));

        let filtered = self.filter.apply(&market, signals);
        output
            .events
            .extend(filtered.new_flags.iter().map(|flag| flag.to_event(now)));
        for signal in filtered.blocked {
            self.stats.manipulation_blocked += 1;
            output.events.push(suppressed(&signal, SuppressionReason::ManipulationBlocked, now));
        }

        for signal in filtered.passed {
            if !self.cooldowns.allow(signal.pattern, signal.instrument, now) {
                debug!(
                    pattern = %signal.pattern,
                    instrument = %signal.instrument,
                    remaining_ms = self.cooldowns.remaining(signal.pattern, signal.instrument, now).num_milliseconds(),
                    "Candidate in cooldown"
                );
                self.stats.cooldown_suppressed += 1;
                output.events.push(suppressed(&signal, SuppressionReason::Cooldown, now));
                continue;
            }

            if self.tracker.is_confirmable(signal.pattern) {
                let (pattern, instrument) = (signal.pattern, signal.instrument);
                match self.tracker.admit(signal.clone(), now) {
                    Ok(_) => {
                        self.cooldowns.record(pattern, instrument, now);
                        output.admitted_pending += 1;
                    }
                    Err(rejection) => {
                        self.stats.pending_rejected += 1;
                        output.events.push(rejection.to_event(&signal, now));
                    }
                }
            } else {
                self.cooldowns.record(signal.pattern, signal.instrument, now);
                self.stats.forwarded += 1;
                output.ready.push(signal);
            }
        }

        if !output.ready.is_empty() || output.admitted_pending > 0 {
            info!(
                sequence = market.sequence,
                ready = output.ready.len(),
                pending = output.admitted_pending,
                "Admission cycle complete"
            );
        }
        output
    }

    /// Resolve pending confirmations against the latest snapshot
    pub fn check_confirmations(&mut self, market: &MarketSnapshot, now: DateTime<Utc>) -> ConfirmationOutput {
        let mut output = ConfirmationOutput::default();
        for resolution in self.tracker.check(market, now) {
            output.events.push(resolution.to_event());
            if resolution.signal.confirmed {
                self.stats.forwarded += 1;
                output.confirmed.push(resolution.signal);
            }
        }
        output
    }

    pub fn apply_reference_rate(&mut self, rate: Decimal, now: DateTime<Utc>) -> ObservabilityEvent {
        self.calculated.apply_rate(rate, now)
    }

    pub fn reference_rate_failed(&mut self, error: &FetchError, now: DateTime<Utc>) -> ObservabilityEvent {
        self.calculated.mark_failed(error, now)
    }

    pub fn calculated(&self) -> &CalculatedMarketModule {
        &self.calculated
    }

    pub fn tracker(&self) -> &ConfirmationTracker {
        &self.tracker
    }

    pub fn detector_count(&self) -> usize {
        self.bank.detector_count()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            confirmation: self.tracker.stats(),
            ..self.stats.clone()
        }
    }
}

fn suppressed(signal: &PatternSignal, reason: SuppressionReason, now: DateTime<Utc>) -> ObservabilityEvent {
    ObservabilityEvent::CandidateSuppressed {
        timestamp: now,
        signal_id: signal.id,
        pattern: signal.pattern,
        instrument: signal.instrument,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DetectorConfig, ManipulationConfig, MarketStateConfig, PressureConfig};
    use crate::detectors::{Detector, DivergenceDetector, PressureDetector};
    use crate::market_state::RollingMarketState;
    use chrono::{Duration, TimeZone};
    use common::{BookLevel, BookSnapshot, Instrument, PatternType, Side, Trade};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn create_test_trade(secs: i64, side: Side, volume: i64) -> Trade {
        Trade::new(ts(secs), Instrument::Wdo, side, 5000.0, volume)
    }

    fn pressure_bank() -> PatternDetectorBank {
        PatternDetectorBank::new().add_detector(Detector::Pressure(PressureDetector::new(PressureConfig {
            lookback_trades: 10,
            ..PressureConfig::default()
        })))
    }

    fn create_test_pipeline() -> SignalPipeline {
        SignalPipeline::new(&SignalConfig::default())
            .unwrap()
            .with_bank(pressure_bank())
    }

    /// 80% buy volume over the last ten trades, ending at `end`
    fn buy_pressure(state: &mut RollingMarketState, end: i64) -> Arc<MarketSnapshot> {
        for i in 0..10 {
            let side = if i < 8 { Side::Buy } else { Side::Sell };
            state.append_trade(create_test_trade(end - 9 + i, side, 10)).unwrap();
        }
        Arc::new(state.snapshot())
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_repeat_detection() {
        let mut state = RollingMarketState::new(MarketStateConfig::default());
        let mut pipeline = create_test_pipeline();

        let first = pipeline.process(buy_pressure(&mut state, 10)).await;
        assert_eq!(first.ready.len(), 1);
        assert_eq!(first.ready[0].pattern, PatternType::Pressure);

        // pressure cooldown is 15s
        let second = pipeline.process(buy_pressure(&mut state, 20)).await;
        assert!(second.ready.is_empty());
        assert!(matches!(
            second.events[0],
            ObservabilityEvent::CandidateSuppressed { reason: SuppressionReason::Cooldown, .. }
        ));

        let third = pipeline.process(buy_pressure(&mut state, 35)).await;
        assert_eq!(third.ready.len(), 1);
        assert!(third.ready[0].timestamp - first.ready[0].timestamp >= Duration::seconds(15));

        let stats = pipeline.stats();
        assert_eq!(stats.forwarded, 2);
        assert_eq!(stats.cooldown_suppressed, 1);
    }

    #[tokio::test]
    async fn test_parallel_matches_inline() {
        let mut state = RollingMarketState::new(MarketStateConfig::default());
        let market = buy_pressure(&mut state, 10);

        let mut config = SignalConfig::default();
        config.pipeline.parallel_detectors = true;
        let mut parallel = SignalPipeline::new(&config).unwrap().with_bank(pressure_bank());
        let mut inline = create_test_pipeline();

        let a = parallel.process(Arc::clone(&market)).await;
        let b = inline.process(market).await;
        assert_eq!(a.ready.len(), b.ready.len());
        assert_eq!(a.ready[0].direction, b.ready[0].direction);
    }

    #[tokio::test]
    async fn test_manipulation_block_suppresses() {
        let mut config = SignalConfig::default();
        config.manipulation = ManipulationConfig::default();
        config.manipulation.spoofing.action = common::FilterAction::Block;
        let mut pipeline = SignalPipeline::new(&config).unwrap().with_bank(pressure_bank());

        let mut state = RollingMarketState::new(MarketStateConfig::default());
        state
            .append_book(BookSnapshot {
                timestamp: ts(0),
                instrument: Instrument::Wdo,
                bids: vec![BookLevel::new(4999.5, 600)],
                asks: vec![BookLevel::new(5000.0, 20)],
            })
            .unwrap();
        let output = pipeline.process(buy_pressure(&mut state, 10)).await;

        assert!(output.ready.is_empty());
        assert!(output.events.iter().any(|e| matches!(e, ObservabilityEvent::ManipulationFlagged { .. })));
        assert!(output.events.iter().any(|e| matches!(
            e,
            ObservabilityEvent::CandidateSuppressed { reason: SuppressionReason::ManipulationBlocked, .. }
        )));
        // blocked candidates never start a cooldown
        assert!(pipeline.cooldowns.allow(PatternType::Pressure, Instrument::Wdo, ts(11)));
    }

    #[tokio::test]
    async fn test_confirmable_pattern_goes_pending() {
        let bank = PatternDetectorBank::new().add_detector(Detector::Divergence(DivergenceDetector::new(
            DetectorConfig::default().divergence,
        )));
        let mut pipeline = create_test_pipeline().with_bank(bank);
        let mut state = RollingMarketState::new(MarketStateConfig::default());

        // price drifts down while buyers lift size
        state
            .append_trade(Trade::new(ts(0), Instrument::Wdo, Side::Sell, 5005.0, 1))
            .unwrap();
        for i in 1..10 {
            state
                .append_trade(Trade::new(ts(i), Instrument::Wdo, Side::Buy, 5005.0 - i as f64 * 0.5, 20))
                .unwrap();
        }
        let market = Arc::new(state.snapshot());
        let output = pipeline.process(Arc::clone(&market)).await;

        assert!(output.ready.is_empty());
        assert_eq!(output.admitted_pending, 1);
        assert!(pipeline.tracker().is_pending(PatternType::Divergence, Instrument::Wdo));

        let expired = pipeline.check_confirmations(&market, market.timestamp + Duration::seconds(25));
        assert!(expired.confirmed.is_empty());
        assert!(matches!(
            expired.events[0],
            ObservabilityEvent::ConfirmationResolved { outcome: common::ConfirmationOutcome::Expired, .. }
        ));
        assert_eq!(pipeline.tracker().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reference_rate_enables_ladder() {
        let mut pipeline = create_test_pipeline();
        assert!(pipeline.calculated().ladder().is_none());
        let event = pipeline.apply_reference_rate(rust_decimal_macros::dec!(5.0), ts(0));
        assert!(matches!(event, ObservabilityEvent::LadderRefreshed { .. }));
        assert!(pipeline.calculated().is_usable(ts(1)));
    }
}
