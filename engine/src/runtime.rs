//! Task wiring
//!
//! A single writer task owns the rolling market state and publishes every
//! accepted event as a new snapshot on a watch channel (latest wins). The
//! admission task owns the signal pipeline and the risk gate, so every
//! admission decision, confirmation and breaker transition is serialized.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::{MarketEvent, ObservabilityEvent, PatternSignal};
use data_ingestion::RateUpdate;
use risk_management::{RiskGate, RiskStats};
use serde::Serialize;
use signal_generation::{
    IngestStats, MarketSnapshot, PipelineStats, RollingMarketState, SignalPipeline, SignalSink, SinkStats,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::control::Control;
use crate::event_bus::EventBus;

/// Engine time, driven by market data
///
/// Between snapshots it advances with the wall clock so pending
/// confirmations and risk windows still expire in a quiet market. It never
/// moves backwards.
#[derive(Debug, Clone, Default)]
pub struct DataClock {
    anchor: Option<(DateTime<Utc>, Instant)>,
    last: Option<DateTime<Utc>>,
}

impl DataClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-anchor on a snapshot timestamp
    pub fn observe(&mut self, data_time: DateTime<Utc>) {
        let data_time = self.last.map_or(data_time, |last| last.max(data_time));
        self.anchor = Some((data_time, Instant::now()));
        self.last = Some(data_time);
    }

    /// Current engine time, `None` before the first snapshot
    pub fn now(&mut self) -> Option<DateTime<Utc>> {
        let (data_time, observed_at) = self.anchor?;
        let elapsed = ChronoDuration::from_std(observed_at.elapsed()).unwrap_or_else(|_| ChronoDuration::zero());
        let now = self.last.map_or(data_time + elapsed, |last| last.max(data_time + elapsed));
        self.last = Some(now);
        Some(now)
    }

    /// Engine time, falling back to the wall clock before any data
    pub fn now_or_wall(&mut self) -> DateTime<Utc> {
        self.now().unwrap_or_else(Utc::now)
    }
}

/// Channels feeding the engine
pub struct EngineInputs {
    pub events: mpsc::Receiver<MarketEvent>,
    pub rates: Option<mpsc::Receiver<RateUpdate>>,
    pub controls: Option<mpsc::Receiver<Control>>,
}

impl EngineInputs {
    pub fn new(events: mpsc::Receiver<MarketEvent>) -> Self {
        Self {
            events,
            rates: None,
            controls: None,
        }
    }

    pub fn with_rates(mut self, rates: mpsc::Receiver<RateUpdate>) -> Self {
        self.rates = Some(rates);
        self
    }

    pub fn with_controls(mut self, controls: mpsc::Receiver<Control>) -> Self {
        self.controls = Some(controls);
        self
    }
}

/// Final statistics of one run
#[derive(Debug, Clone, Serialize)]
pub struct EngineReport {
    pub ingest: IngestStats,
    pub pipeline: PipelineStats,
    pub risk: RiskStats,
    pub sink: SinkStats,
    /// Accepted signals the sink failed to write
    pub sink_failures: u64,
}

pub struct Engine {
    config: EngineConfig,
    pipeline: SignalPipeline,
    gate: RiskGate,
    bus: EventBus,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let pipeline = SignalPipeline::new(&config.signals)?;
        let gate = RiskGate::new(config.risk.clone())?;
        let bus = EventBus::new(config.runtime.event_capacity);

        info!(
            detectors = pipeline.detector_count(),
            max_pending = config.signals.confirmation.max_pending,
            "Engine initialized"
        );

        Ok(Self {
            config,
            pipeline,
            gate,
            bus,
        })
    }

    /// Replace the pipeline built from configuration
    pub fn with_pipeline(mut self, pipeline: SignalPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Run until the market event stream ends or `shutdown` flips to true
    pub async fn run(
        self,
        inputs: EngineInputs,
        sink: Arc<dyn SignalSink>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<EngineReport> {
        let Engine {
            config,
            pipeline,
            gate,
            bus,
        } = self;

        let state = RollingMarketState::new(config.signals.market_state.clone());
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(MarketSnapshot::empty()));
        let writer = tokio::spawn(run_state_writer(state, inputs.events, snapshot_tx, bus.clone()));

        let admission = AdmissionTask {
            pipeline,
            gate,
            sink,
            bus,
            clock: DataClock::new(),
            latest: Arc::new(MarketSnapshot::empty()),
            processed_sequence: None,
            sink_failures: 0,
        };
        let result = admission
            .run(
                &config,
                snapshot_rx,
                inputs.rates,
                inputs.controls,
                shutdown,
            )
            .await;

        // the writer stops once the snapshot receiver is gone
        let ingest = writer.await?;
        let (pipeline, risk, sink, sink_failures) = result?;
        Ok(EngineReport {
            ingest,
            pipeline,
            risk,
            sink,
            sink_failures,
        })
    }
}

/// Apply market events in order and publish each resulting snapshot
pub async fn run_state_writer(
    mut state: RollingMarketState,
    mut events: mpsc::Receiver<MarketEvent>,
    snapshots: watch::Sender<Arc<MarketSnapshot>>,
    bus: EventBus,
) -> IngestStats {
    loop {
        let event = tokio::select! {
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = snapshots.closed() => {
                debug!("Snapshot receiver dropped, stopping state writer");
                break;
            }
        };

        let (instrument, timestamp) = (event.instrument(), event.timestamp());
        match state.apply(event) {
            Ok(()) => {
                snapshots.send_replace(Arc::new(state.snapshot()));
            }
            Err(e) => {
                warn!(instrument = %instrument, reason = e.kind(), "Rejected market event: {}", e);
                bus.publish(ObservabilityEvent::InputRejected {
                    timestamp,
                    instrument,
                    reason: e.kind().to_string(),
                    detail: e.to_string(),
                });
            }
        }
    }

    let stats = state.stats().clone();
    info!(
        trades = stats.accepted_trades,
        books = stats.accepted_books,
        rejected = stats.total_rejected(),
        "State writer finished"
    );
    stats
}

struct AdmissionTask {
    pipeline: SignalPipeline,
    gate: RiskGate,
    sink: Arc<dyn SignalSink>,
    bus: EventBus,
    clock: DataClock,
    latest: Arc<MarketSnapshot>,
    processed_sequence: Option<u64>,
    sink_failures: u64,
}

impl AdmissionTask {
    async fn run(
        mut self,
        config: &EngineConfig,
        mut snapshots: watch::Receiver<Arc<MarketSnapshot>>,
        mut rates: Option<mpsc::Receiver<RateUpdate>>,
        mut controls: Option<mpsc::Receiver<Control>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(PipelineStats, RiskStats, SinkStats, u64)> {
        let mut confirmations =
            tokio::time::interval(Duration::from_millis(config.signals.confirmation.check_interval_ms));
        confirmations.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats_ticker = tokio::time::interval(Duration::from_secs(config.runtime.stats_interval_secs));
        stats_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick of an interval completes immediately
        stats_ticker.tick().await;

        info!("🚀 Admission task started");

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested");
                        break;
                    }
                }

                Some(control) = recv_optional(&mut controls) => {
                    let now = self.clock.now_or_wall();
                    debug!(?control, "Control received");
                    control.apply(&mut self.gate, now);
                    self.publish_gate_events();
                }

                Some(update) = recv_optional(&mut rates) => {
                    self.apply_rate(update);
                }

                // timers ahead of snapshots so a busy feed cannot starve expiry
                _ = confirmations.tick() => {
                    self.check_confirmations().await;
                }

                _ = stats_ticker.tick() => {
                    self.log_stats().await;
                }

                changed = snapshots.changed() => {
                    if changed.is_err() {
                        info!("Market event stream closed");
                        break;
                    }
                    let market = Arc::clone(&snapshots.borrow_and_update());
                    self.admit_snapshot(market).await;
                }
            }
        }

        // drain what the writer published last
        let market = Arc::clone(&snapshots.borrow());
        self.admit_snapshot(market).await;
        self.check_confirmations().await;
        self.log_stats().await;

        let now = self.clock.now_or_wall();
        let sink_stats = self.sink.stats().await?;
        Ok((self.pipeline.stats(), self.gate.stats(now), sink_stats, self.sink_failures))
    }

    async fn admit_snapshot(&mut self, market: Arc<MarketSnapshot>) {
        if !market.has_data() || self.processed_sequence == Some(market.sequence) {
            return;
        }
        self.processed_sequence = Some(market.sequence);
        self.clock.observe(market.timestamp);
        self.latest = Arc::clone(&market);

        let now = market.timestamp;
        let output = self.pipeline.process(market).await;
        self.bus.publish_all(output.events);

        for signal in output.ready {
            self.submit(signal, now).await;
        }
        self.publish_gate_events();
    }

    async fn check_confirmations(&mut self) {
        let Some(now) = self.clock.now() else {
            return;
        };

        let output = self.pipeline.check_confirmations(&self.latest, now);
        self.bus.publish_all(output.events);
        for signal in output.confirmed {
            self.submit(signal, now).await;
        }

        self.gate.tick(now);
        self.publish_gate_events();
    }

    /// Risk gate, then the sink; a failed write is reported and skipped
    async fn submit(&mut self, mut signal: PatternSignal, now: DateTime<Utc>) {
        match self.gate.evaluate(&signal, now) {
            Ok(assessment) => {
                signal.annotate(format!("quality {:.3} ({:?})", assessment.score, assessment.rating));
                info!(
                    signal_id = %signal.id,
                    pattern = %signal.pattern,
                    instrument = %signal.instrument,
                    direction = ?signal.direction,
                    price = signal.price,
                    quality = assessment.score,
                    "✅ Signal accepted"
                );
                if let Err(e) = self.sink.emit(&signal).await {
                    error!(signal_id = %signal.id, "Failed to emit signal: {:#}", e);
                    self.sink_failures += 1;
                    self.bus.publish(ObservabilityEvent::SinkFailed {
                        timestamp: now,
                        signal_id: signal.id,
                        pattern: signal.pattern,
                        instrument: signal.instrument,
                        error: format!("{:#}", e),
                    });
                }
            }
            Err(violation) => {
                debug!(signal_id = %signal.id, "Gate refused signal: {}", violation);
            }
        }
    }

    fn apply_rate(&mut self, update: RateUpdate) {
        let now = self.clock.now_or_wall();
        let event = match update {
            RateUpdate::Fetched(rate) => self.pipeline.apply_reference_rate(rate, now),
            RateUpdate::Fallback(rate) => {
                warn!(rate = %rate, "Applying fallback reference rate");
                self.pipeline.apply_reference_rate(rate, now)
            }
            RateUpdate::Failed(e) => self.pipeline.reference_rate_failed(&e, now),
        };
        self.bus.publish(event);
    }

    fn publish_gate_events(&mut self) {
        self.bus.publish_all(self.gate.drain_events());
    }

    async fn log_stats(&mut self) {
        let now = self.clock.now_or_wall();
        let pipeline = self.pipeline.stats();
        let risk = self.gate.stats(now);
        let emitted = match self.sink.stats().await {
            Ok(stats) => stats.total_signals,
            Err(e) => {
                warn!("Sink stats unavailable: {}", e);
                0
            }
        };

        info!(
            cycles = pipeline.cycles,
            candidates = pipeline.candidates,
            pending = self.pipeline.tracker().pending_count(),
            forwarded = pipeline.forwarded,
            approved = risk.approved,
            rejected = risk.rejected,
            emitted,
            sink_failures = self.sink_failures,
            risk_level = ?risk.risk_level,
            "📊 Engine stats"
        );
    }
}

/// Next message of an optional channel; pends forever when absent or closed
async fn recv_optional<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(inner) => match inner.recv().await {
            Some(value) => Some(value),
            None => {
                *rx = None;
                std::future::pending().await
            }
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common::{BookLevel, BookSnapshot, Instrument, Side, Trade};
    use risk_management::BreakerKind;
    use rust_decimal_macros::dec;
    use signal_generation::config::{DivergenceConfig, MomentumConfig, PressureConfig};
    use signal_generation::detectors::{MomentumExtremeDetector, PressureDetector};
    use signal_generation::{ChannelSink, Detector, InMemorySink, PatternDetectorBank};
    use tokio::sync::broadcast;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 13, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    fn create_test_trade(secs: i64, side: Side, volume: i64) -> MarketEvent {
        MarketEvent::Trade(Trade::new(ts(secs), Instrument::Wdo, side, 5012.5, volume))
    }

    /// 8 of 10 lots bought; only the tenth trade reaches the minimum volume
    fn buy_pressure_events() -> Vec<MarketEvent> {
        (0..10)
            .map(|i| {
                let side = if i < 8 { Side::Buy } else { Side::Sell };
                create_test_trade(i + 1, side, 10)
            })
            .collect()
    }

    fn create_test_book(timestamp: DateTime<Utc>) -> MarketEvent {
        MarketEvent::Book(BookSnapshot {
            timestamp,
            instrument: Instrument::Wdo,
            bids: vec![BookLevel::new(5012.0, 20)],
            asks: vec![BookLevel::new(5013.0, 20)],
        })
    }

    fn drain_bus(rx: &mut broadcast::Receiver<ObservabilityEvent>) -> Vec<ObservabilityEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }

    fn create_test_engine() -> Engine {
        let mut config = EngineConfig::default();
        config.risk.quality.threshold = 0.0;
        let pipeline = SignalPipeline::new(&config.signals).unwrap().with_bank(
            PatternDetectorBank::new().add_detector(Detector::Pressure(PressureDetector::new(PressureConfig {
                lookback_trades: 10,
                ..PressureConfig::default()
            }))),
        );
        Engine::new(config).unwrap().with_pipeline(pipeline)
    }

    async fn replay(
        engine: Engine,
        events: Vec<MarketEvent>,
        controls: Vec<Control>,
        rates: Vec<RateUpdate>,
    ) -> (EngineReport, Arc<InMemorySink>) {
        let sink = Arc::new(InMemorySink::new());
        let report = replay_into(engine, events, controls, rates, sink.clone()).await;
        (report, sink)
    }

    async fn replay_into(
        engine: Engine,
        events: Vec<MarketEvent>,
        controls: Vec<Control>,
        rates: Vec<RateUpdate>,
        sink: Arc<dyn SignalSink>,
    ) -> EngineReport {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (control_tx, control_rx) = mpsc::channel(8);
        let (rate_tx, rate_rx) = mpsc::channel(8);
        for control in controls {
            control_tx.send(control).await.unwrap();
        }
        for rate in rates {
            rate_tx.send(rate).await.unwrap();
        }

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let inputs = EngineInputs::new(event_rx)
            .with_controls(control_rx)
            .with_rates(rate_rx);
        let handle = tokio::spawn(engine.run(inputs, sink, shutdown_rx));

        for event in events {
            event_tx.send(event).await.unwrap();
        }
        drop(event_tx);

        handle.await.unwrap().unwrap()
    }

    #[test]
    fn test_data_clock_is_monotonic() {
        let mut clock = DataClock::new();
        assert!(clock.now().is_none());

        clock.observe(ts(10));
        assert!(clock.now().unwrap() >= ts(10));

        // an older snapshot never winds the clock back
        clock.observe(ts(5));
        assert!(clock.now().unwrap() >= ts(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_clock_advances_with_wall_time() {
        let mut clock = DataClock::new();
        clock.observe(ts(0));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(clock.now(), Some(ts(30)));
    }

    #[tokio::test]
    async fn test_replay_emits_accepted_signal() {
        let (report, sink) = replay(create_test_engine(), buy_pressure_events(), vec![], vec![]).await;

        let signals = sink.get_all().await;
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].instrument, Instrument::Wdo);
        assert_eq!(signals[0].timestamp, ts(10));
        assert!(signals[0].annotations.iter().any(|note| note.starts_with("quality")));

        assert_eq!(report.ingest.accepted_trades, 10);
        assert_eq!(report.pipeline.forwarded, 1);
        assert_eq!(report.risk.approved, 1);
        assert_eq!(report.sink.total_signals, 1);
    }

    #[tokio::test]
    async fn test_rejected_input_is_published() {
        let engine = create_test_engine();
        let mut events_rx = engine.bus().subscribe();

        let mut events = buy_pressure_events();
        events.push(create_test_trade(11, Side::Buy, 0));
        events.push(MarketEvent::Book(BookSnapshot {
            timestamp: ts(12),
            instrument: Instrument::Dol,
            bids: vec![],
            asks: vec![BookLevel::new(5013.0, 10)],
        }));
        let (report, _) = replay(engine, events, vec![], vec![]).await;

        assert_eq!(report.ingest.total_rejected(), 2);
        let mut reasons = Vec::new();
        while let Ok(event) = events_rx.try_recv() {
            if let ObservabilityEvent::InputRejected { reason, .. } = event {
                reasons.push(reason);
            }
        }
        assert_eq!(reasons, vec!["non_positive_volume", "empty_book_side"]);
    }

    #[tokio::test]
    async fn test_emergency_halt_blocks_emission() {
        let controls = vec![Control::Emergency {
            reason: "manual".to_string(),
        }];
        let (report, sink) = replay(create_test_engine(), buy_pressure_events(), controls, vec![]).await;

        assert!(sink.get_all().await.is_empty());
        assert_eq!(report.pipeline.forwarded, 1);
        assert_eq!(report.risk.approved, 0);
        assert_eq!(report.risk.rejections.get("circuit_breaker_open"), Some(&1));
        assert!(report
            .risk
            .open_breakers
            .contains(&BreakerKind::Emergency.to_string()));
    }

    #[tokio::test]
    async fn test_reference_rate_reaches_pipeline() {
        let engine = create_test_engine();
        let mut events_rx = engine.bus().subscribe();
        let rates = vec![RateUpdate::Fetched(dec!(5.0))];
        replay(engine, buy_pressure_events(), vec![], rates).await;

        let mut refreshed = false;
        while let Ok(event) = events_rx.try_recv() {
            refreshed |= matches!(event, ObservabilityEvent::LadderRefreshed { .. });
        }
        assert!(refreshed);
    }

    #[tokio::test]
    async fn test_shutdown_returns_report() {
        let (_event_tx, event_rx) = mpsc::channel::<MarketEvent>(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sink = Arc::new(InMemorySink::new());
        let handle = tokio::spawn(create_test_engine().run(EngineInputs::new(event_rx), sink, shutdown_rx));

        shutdown_tx.send(true).unwrap();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.ingest.accepted_trades, 0);
        assert_eq!(report.sink.total_signals, 0);
    }

    #[tokio::test]
    async fn test_sink_failure_is_reported_and_engine_continues() {
        let engine = create_test_engine();
        let mut events_rx = engine.bus().subscribe();
        let (sink, receiver) = ChannelSink::channel(4);
        drop(receiver);

        // the run still ends with a report rather than an error
        let report = replay_into(engine, buy_pressure_events(), vec![], vec![], Arc::new(sink)).await;

        assert_eq!(report.risk.approved, 1);
        assert_eq!(report.sink.total_signals, 0);
        assert_eq!(report.sink_failures, 1);
        assert_eq!(report.ingest.accepted_trades, 10);

        let failures: Vec<_> = drain_bus(&mut events_rx)
            .into_iter()
            .filter(|event| event.name() == "sink_failed")
            .collect();
        assert_eq!(failures.len(), 1);
        match &failures[0] {
            ObservabilityEvent::SinkFailed { instrument, pattern, error, .. } => {
                assert_eq!(*instrument, Instrument::Wdo);
                assert_eq!(*pattern, common::PatternType::Pressure);
                assert!(error.contains("receiver dropped"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_expires_during_snapshot_flood() {
        let mut config = EngineConfig::default();
        config.signals.confirmation.check_interval_ms = 100;
        config.runtime.event_capacity = 1 << 16;
        let pipeline = SignalPipeline::new(&config.signals).unwrap().with_bank(
            PatternDetectorBank::new().add_detector(Detector::MomentumExtreme(MomentumExtremeDetector::new(
                MomentumConfig {
                    roc_threshold: 15.0,
                    ..MomentumConfig::default()
                },
                DivergenceConfig::default(),
            ))),
        );
        let engine = Engine::new(config).unwrap().with_pipeline(pipeline);
        let mut events_rx = engine.bus().subscribe();

        let (event_tx, event_rx) = mpsc::channel(64);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let sink = Arc::new(InMemorySink::new());
        let handle = tokio::spawn(engine.run(EngineInputs::new(event_rx), sink, shutdown_rx));

        // CVD +20 inside the period: momentum pending until ts(17)
        event_tx.send(create_test_trade(1, Side::Buy, 10)).await.unwrap();
        event_tx.send(create_test_trade(2, Side::Buy, 10)).await.unwrap();

        // books only, so the pending entry can neither confirm nor invalidate
        let mut expired_by = None;
        for step in 1..=2000 {
            let timestamp = ts(2) + ChronoDuration::milliseconds(20 * step);
            event_tx.send(create_test_book(timestamp)).await.unwrap();
            tokio::time::advance(Duration::from_millis(20)).await;

            let expired = drain_bus(&mut events_rx).into_iter().any(|event| {
                matches!(
                    event,
                    ObservabilityEvent::ConfirmationResolved {
                        outcome: common::ConfirmationOutcome::Expired,
                        ..
                    }
                )
            });
            if expired {
                expired_by = Some(timestamp);
                break;
            }
        }
        drop(event_tx);
        let report = handle.await.unwrap().unwrap();

        let expired_by = expired_by.expect("pending entry should expire while books keep arriving");
        // deadline ts(17), checked every 100ms of engine time
        assert!(expired_by > ts(16));
        assert!(expired_by < ts(18));
        assert_eq!(report.pipeline.confirmation.expired, 1);
    }
}
