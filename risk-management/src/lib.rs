//! Risk Gate (final admission control)
//!
//! Every signal that survives detection, filtering and confirmation passes
//! through the gate: circuit breakers, sliding emission windows, the
//! concurrency limit and quality scoring, in that order.

mod config;
mod metrics;
mod quality;
mod regime;
mod risk;

pub use config::{CircuitBreakerConfig, QualityConfig, RiskConfig, RiskLimits};
pub use metrics::{OutcomeMetrics, RiskStats};
pub use quality::{QualityAssessment, QualityComponents, QualityRating, QualityScorer};
pub use regime::{AdjustmentFactors, EffectiveLimits, MarketRegime, RegimeAdapter};
pub use risk::{
    ActiveSignal, BreakerKind, BreakerTransition, CircuitBreaker, RateWindows, RiskLevel, RiskViolation, WindowCounts,
};

use chrono::{DateTime, Duration, Utc};
use common::{ConfigError, Instrument, ObservabilityEvent, PatternSignal, Uuid};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Owns all risk state; driven by a single admission task
#[derive(Debug)]
pub struct RiskGate {
    config: RiskConfig,
    breakers: BTreeMap<BreakerKind, CircuitBreaker>,
    windows: RateWindows,
    scorer: QualityScorer,
    regimes: RegimeAdapter,
    outcomes: OutcomeMetrics,
    stats: RiskStats,
    last_daily_reset: Option<DateTime<Utc>>,
    events: Vec<ObservabilityEvent>,
}

impl RiskGate {
    pub fn new(config: RiskConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let cooldown = Duration::seconds(config.circuit_breakers.cooldown_secs as i64);
        let breakers = BreakerKind::ALL
            .iter()
            .map(|kind| (*kind, CircuitBreaker::new(*kind, cooldown)))
            .collect();

        info!(
            per_minute = config.limits.max_signals_per_minute,
            per_hour = config.limits.max_signals_per_hour,
            concurrent = config.limits.max_concurrent_signals,
            quality = config.quality.threshold,
            "Risk gate initialized"
        );

        Ok(Self {
            scorer: QualityScorer::new(config.quality.clone()),
            regimes: RegimeAdapter::new(&config),
            breakers,
            windows: RateWindows::new(),
            outcomes: OutcomeMetrics::empty(),
            stats: RiskStats::default(),
            last_daily_reset: None,
            events: Vec::new(),
            config,
        })
    }

    /// Admit or reject a signal; an admitted signal is counted immediately
    pub fn evaluate(&mut self, signal: &PatternSignal, now: DateTime<Utc>) -> Result<QualityAssessment, RiskViolation> {
        self.tick(now);
        self.stats.evaluated += 1;

        match self.check(signal) {
            Ok(assessment) => {
                let validity = Duration::seconds(self.regimes.limits().signal_validity_secs as i64);
                self.windows.record(signal, now, validity);
                self.stats.approved += 1;

                debug!(
                    signal_id = %signal.id,
                    pattern = %signal.pattern,
                    instrument = %signal.instrument,
                    score = assessment.score,
                    rating = ?assessment.rating,
                    "Signal approved by risk gate"
                );
                Ok(assessment)
            }
            Err(violation) => {
                self.stats.rejected += 1;
                *self
                    .stats
                    .rejections
                    .entry(violation.kind().to_string())
                    .or_insert(0) += 1;

                warn!(
                    signal_id = %signal.id,
                    pattern = %signal.pattern,
                    instrument = %signal.instrument,
                    reason = %violation,
                    "Signal rejected by risk gate"
                );
                self.events.push(violation.to_event(signal, now));
                Err(violation)
            }
        }
    }

    fn check(&self, signal: &PatternSignal) -> Result<QualityAssessment, RiskViolation> {
        if let Some(breaker) = self.open_breaker() {
            return Err(RiskViolation::CircuitBreakerOpen {
                breaker: breaker.kind(),
                reason: breaker.reason().unwrap_or_default().to_string(),
                until: breaker.until(),
            });
        }

        let limits = self.regimes.limits();
        let counts = self.windows.counts();

        if counts.minute >= limits.max_signals_per_minute {
            return Err(RiskViolation::MinuteRateExceeded {
                current: counts.minute,
                limit: limits.max_signals_per_minute,
            });
        }
        if counts.hour >= limits.max_signals_per_hour {
            return Err(RiskViolation::HourRateExceeded {
                current: counts.hour,
                limit: limits.max_signals_per_hour,
            });
        }
        if signal.pattern.is_confluence() && counts.confluence_hour >= limits.max_confluence_per_hour {
            return Err(RiskViolation::ConfluenceRateExceeded {
                current: counts.confluence_hour,
                limit: limits.max_confluence_per_hour,
            });
        }
        if counts.active >= limits.max_concurrent_signals {
            return Err(RiskViolation::MaxConcurrentExceeded {
                current: counts.active,
                limit: limits.max_concurrent_signals,
            });
        }

        let assessment = self.scorer.assess(signal);
        if assessment.score < limits.quality_threshold {
            return Err(RiskViolation::QualityBelowThreshold {
                score: assessment.score,
                threshold: limits.quality_threshold,
            });
        }

        Ok(assessment)
    }

    /// Breakers are checked in a fixed order; `tick` has already cleared expired ones
    fn open_breaker(&self) -> Option<&CircuitBreaker> {
        self.breakers.values().find(|b| b.until().is_some())
    }

    /// Feed a realized result and trip any breaker whose limit it crosses
    pub fn record_outcome(&mut self, pnl: Decimal, now: DateTime<Utc>) -> Vec<BreakerTransition> {
        self.tick(now);
        self.outcomes.record(pnl, now);

        info!(
            pnl = %pnl,
            daily_pnl = %self.outcomes.daily_pnl,
            consecutive_losses = self.outcomes.consecutive_losses,
            "Outcome recorded"
        );

        if !self.config.circuit_breakers.enabled {
            return Vec::new();
        }

        let limits = self.regimes.limits().clone();
        let daily_loss_limit = self.config.circuit_breakers.daily_loss_limit;
        let drawdown = self.outcomes.drawdown_percent();
        let mut trips = Vec::new();

        if self.outcomes.consecutive_losses >= limits.consecutive_losses_limit {
            let reason = format!(
                "{} consecutive losses (limit {})",
                self.outcomes.consecutive_losses, limits.consecutive_losses_limit
            );
            trips.push((BreakerKind::ConsecutiveLosses, reason));
        }
        if drawdown >= limits.max_drawdown_percent {
            let reason = format!("drawdown {:.2}% (limit {:.2}%)", drawdown, limits.max_drawdown_percent);
            trips.push((BreakerKind::Drawdown, reason));
        }
        if self.outcomes.daily_pnl <= -daily_loss_limit {
            let reason = format!("daily pnl {} (limit -{})", self.outcomes.daily_pnl, daily_loss_limit);
            trips.push((BreakerKind::DailyLoss, reason));
        }

        trips
            .into_iter()
            .filter_map(|(kind, reason)| self.trip(kind, reason, now))
            .collect()
    }

    /// Manual halt
    pub fn trip_emergency(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Option<BreakerTransition> {
        self.trip(BreakerKind::Emergency, reason.into(), now)
    }

    pub fn reset_breaker(&mut self, kind: BreakerKind, now: DateTime<Utc>) -> Option<BreakerTransition> {
        let transition = self.breakers.get_mut(&kind)?.reset(now)?;
        self.events.push(transition.to_event());
        Some(transition)
    }

    fn trip(&mut self, kind: BreakerKind, reason: String, now: DateTime<Utc>) -> Option<BreakerTransition> {
        let transition = self.breakers.get_mut(&kind)?.trigger(reason, now)?;
        self.stats.breaker_trips += 1;
        self.events.push(transition.to_event());
        Some(transition)
    }

    /// Apply a regime label for one instrument
    pub fn update_regime(&mut self, instrument: Instrument, regime: MarketRegime, now: DateTime<Utc>) -> bool {
        let changed = self.regimes.update(instrument, regime, &self.config);
        if changed {
            self.events.push(ObservabilityEvent::RegimeChanged {
                timestamp: now,
                instrument,
                regime: regime.to_string(),
            });
        }
        changed
    }

    /// Advance time: clear expired breakers, slide windows, roll the day over
    pub fn tick(&mut self, now: DateTime<Utc>) {
        for breaker in self.breakers.values_mut() {
            if let Some(transition) = breaker.refresh(now) {
                self.events.push(transition.to_event());
            }
        }
        self.windows.prune(now);
        self.maybe_daily_reset(now);
    }

    /// Reset daily counters once the configured reset time has passed
    pub fn maybe_daily_reset(&mut self, now: DateTime<Utc>) -> bool {
        let mut boundary = now.date_naive().and_time(self.config.daily_reset_utc).and_utc();
        if boundary > now {
            boundary -= Duration::days(1);
        }

        let due = match self.last_daily_reset {
            None => {
                self.last_daily_reset = Some(boundary);
                return false;
            }
            Some(last) => last < boundary,
        };
        if !due {
            return false;
        }

        self.last_daily_reset = Some(boundary);
        self.outcomes = OutcomeMetrics::empty();
        self.windows.clear_rates();
        for kind in [BreakerKind::DailyLoss, BreakerKind::Emergency] {
            if let Some(transition) = self.breakers.get_mut(&kind).and_then(|b| b.reset(now)) {
                self.events.push(transition.to_event());
            }
        }
        for breaker in self.breakers.values_mut() {
            breaker.clear_daily();
        }

        info!(boundary = %boundary, "Daily risk counters reset");
        self.events.push(ObservabilityEvent::DailyReset { timestamp: now });
        true
    }

    /// Release a signal from the concurrency count before its validity ends
    pub fn release_signal(&mut self, signal_id: Uuid) -> bool {
        self.windows.release(signal_id)
    }

    /// Proximity to the breaker limits
    pub fn risk_level(&self, now: DateTime<Utc>) -> RiskLevel {
        if self.breakers.values().any(|b| b.is_active(now)) {
            return RiskLevel::Critical;
        }

        let limits = self.regimes.limits();
        let loss_ratio = self.outcomes.consecutive_losses as f64 / limits.consecutive_losses_limit as f64;
        let drawdown_ratio = self.outcomes.drawdown_percent() / limits.max_drawdown_percent;
        let daily_loss_ratio = if self.outcomes.daily_pnl < Decimal::ZERO {
            (-self.outcomes.daily_pnl / self.config.circuit_breakers.daily_loss_limit)
                .to_f64()
                .unwrap_or(0.0)
        } else {
            0.0
        };

        let score = (loss_ratio * 0.4 + drawdown_ratio * 0.3 + daily_loss_ratio * 0.3).min(1.0);
        RiskLevel::from_score(score)
    }

    pub fn is_halted(&self, now: DateTime<Utc>) -> bool {
        self.breakers.values().any(|b| b.is_active(now))
    }

    pub fn stats(&self, now: DateTime<Utc>) -> RiskStats {
        let mut stats = self.stats.clone();
        stats.windows = self.windows.counts();
        stats.outcomes = self.outcomes.clone();
        stats.open_breakers = self
            .breakers
            .values()
            .filter(|b| b.is_active(now))
            .map(|b| b.kind().to_string())
            .collect();
        stats.risk_level = Some(self.risk_level(now));
        stats
    }

    /// Take the observability events buffered since the last drain
    pub fn drain_events(&mut self) -> Vec<ObservabilityEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn limits(&self) -> &EffectiveLimits {
        self.regimes.limits()
    }

    pub fn regime(&self, instrument: Instrument) -> MarketRegime {
        self.regimes.regime(instrument)
    }

    pub fn breaker(&self, kind: BreakerKind) -> Option<&CircuitBreaker> {
        self.breakers.get(&kind)
    }

    pub fn outcomes(&self) -> &OutcomeMetrics {
        &self.outcomes
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common::{PatternType, SignalDirection};
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn create_test_signal(pattern: PatternType) -> PatternSignal {
        PatternSignal::new(pattern, Instrument::Wdo, SignalDirection::Long, 5000.0, at(0))
            .with_strength(0.9)
            .with_confidence(0.9)
            .with_evidence(json!({ "volume": 240, "trades": 4, "price": 5000.0 }))
    }

    fn create_test_gate(config: RiskConfig) -> RiskGate {
        let mut gate = RiskGate::new(config).unwrap();
        gate.tick(at(0));
        gate
    }

    #[test]
    fn test_admits_qualifying_signal() {
        let mut gate = create_test_gate(RiskConfig::default());
        let assessment = gate.evaluate(&create_test_signal(PatternType::Iceberg), at(1)).unwrap();

        // (0.9 + 0.8 + 0.75 + 1.2) / 5.0 * 0.9
        assert!((assessment.score - 0.657).abs() < 1e-9);
        let stats = gate.stats(at(1));
        assert_eq!(stats.approved, 1);
        assert_eq!(stats.windows.minute, 1);
        assert_eq!(stats.windows.active, 1);
    }

    #[test]
    fn test_rejects_low_quality() {
        let mut gate = create_test_gate(RiskConfig::default());
        let weak = PatternSignal::new(PatternType::BookPulling, Instrument::Dol, SignalDirection::Short, 5000.0, at(0))
            .with_strength(0.3)
            .with_confidence(0.5);

        let err = gate.evaluate(&weak, at(1)).unwrap_err();
        assert!(matches!(err, RiskViolation::QualityBelowThreshold { .. }));
        assert_eq!(gate.stats(at(1)).windows.minute, 0);

        let events = gate.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "risk_rejected");
        assert!(gate.drain_events().is_empty());
    }

    #[test]
    fn test_minute_window_slides() {
        let mut config = RiskConfig::default();
        config.limits.max_signals_per_minute = 3;
        let mut gate = create_test_gate(config);

        for secs in 0..3 {
            gate.evaluate(&create_test_signal(PatternType::Iceberg), at(secs)).unwrap();
        }
        let err = gate.evaluate(&create_test_signal(PatternType::Iceberg), at(30)).unwrap_err();
        assert_eq!(err, RiskViolation::MinuteRateExceeded { current: 3, limit: 3 });

        // entries at 0 and 1 have slid out by 61
        assert!(gate.evaluate(&create_test_signal(PatternType::Iceberg), at(61)).is_ok());
        assert_eq!(gate.stats(at(61)).windows.minute, 2);
    }

    #[test]
    fn test_confluence_cap_is_separate() {
        let mut config = RiskConfig::default();
        config.limits.max_confluence_per_hour = 2;
        config.limits.max_concurrent_signals = 10;
        let mut gate = create_test_gate(config);

        gate.evaluate(&create_test_signal(PatternType::MultiframeConfluence), at(1)).unwrap();
        gate.evaluate(&create_test_signal(PatternType::CalculatedConfluence), at(2)).unwrap();
        let err = gate
            .evaluate(&create_test_signal(PatternType::MultiframeConfluence), at(3))
            .unwrap_err();
        assert!(matches!(err, RiskViolation::ConfluenceRateExceeded { current: 2, limit: 2 }));

        assert!(gate.evaluate(&create_test_signal(PatternType::Iceberg), at(4)).is_ok());
    }

    #[test]
    fn test_concurrency_limit_until_validity_ends() {
        let mut config = RiskConfig::default();
        config.limits.max_concurrent_signals = 2;
        let mut gate = create_test_gate(config);

        gate.evaluate(&create_test_signal(PatternType::Iceberg), at(0)).unwrap();
        let second = create_test_signal(PatternType::Absorption);
        gate.evaluate(&second, at(5)).unwrap();
        let err = gate.evaluate(&create_test_signal(PatternType::Iceberg), at(10)).unwrap_err();
        assert!(matches!(err, RiskViolation::MaxConcurrentExceeded { current: 2, limit: 2 }));

        assert!(gate.release_signal(second.id));
        assert!(gate.evaluate(&create_test_signal(PatternType::Iceberg), at(11)).is_ok());
    }

    #[test]
    fn test_consecutive_losses_halt_until_cooldown() {
        let mut gate = create_test_gate(RiskConfig::default());

        for i in 0..4 {
            assert!(gate.record_outcome(dec!(-10), at(i)).is_empty());
        }
        let trips = gate.record_outcome(dec!(-10), at(4));
        assert_eq!(trips.len(), 1);
        assert_eq!(trips[0].kind, BreakerKind::ConsecutiveLosses);
        assert_eq!(trips[0].until, Some(at(304)));

        for secs in [5, 100, 303] {
            let err = gate.evaluate(&create_test_signal(PatternType::Iceberg), at(secs)).unwrap_err();
            assert!(matches!(
                err,
                RiskViolation::CircuitBreakerOpen { breaker: BreakerKind::ConsecutiveLosses, .. }
            ));
        }
        assert_eq!(gate.risk_level(at(303)), RiskLevel::Critical);

        assert!(gate.evaluate(&create_test_signal(PatternType::Iceberg), at(304)).is_ok());
        let names: Vec<_> = gate.drain_events().iter().map(|e| e.name()).collect();
        assert_eq!(names.iter().filter(|n| **n == "circuit_breaker").count(), 2);
        assert_eq!(names.iter().filter(|n| **n == "risk_rejected").count(), 3);
    }

    #[test]
    fn test_drawdown_trips() {
        let mut gate = create_test_gate(RiskConfig::default());
        assert!(gate.record_outcome(dec!(500), at(1)).is_empty());
        let trips = gate.record_outcome(dec!(-25), at(2));
        assert_eq!(trips.len(), 1);
        assert_eq!(trips[0].kind, BreakerKind::Drawdown);
        assert!(gate.is_halted(at(3)));
    }

    #[test]
    fn test_daily_loss_cleared_by_daily_reset() {
        let mut gate = RiskGate::new(RiskConfig::default()).unwrap();
        let evening = Utc.with_ymd_and_hms(2024, 3, 1, 20, 0, 0).unwrap();
        assert!(!gate.maybe_daily_reset(evening));

        let before_reset = Utc.with_ymd_and_hms(2024, 3, 2, 2, 58, 0).unwrap();
        let trips = gate.record_outcome(dec!(-1000), before_reset);
        assert!(trips.iter().any(|t| t.kind == BreakerKind::DailyLoss));
        gate.drain_events();

        let after_reset = Utc.with_ymd_and_hms(2024, 3, 2, 3, 0, 1).unwrap();
        gate.tick(after_reset);
        assert!(!gate.is_halted(after_reset));
        assert_eq!(gate.outcomes().daily_pnl, Decimal::ZERO);

        let events = gate.drain_events();
        assert!(events.iter().any(|e| e.name() == "daily_reset"));
        assert!(!gate.maybe_daily_reset(after_reset + Duration::hours(1)));
    }

    #[test]
    fn test_emergency_trip_and_reset() {
        let mut gate = create_test_gate(RiskConfig::default());
        assert!(gate.trip_emergency("operator halt", at(1)).is_some());
        assert!(gate.trip_emergency("again", at(2)).is_none());
        assert!(gate.evaluate(&create_test_signal(PatternType::Iceberg), at(3)).is_err());

        assert!(gate.reset_breaker(BreakerKind::Emergency, at(4)).is_some());
        assert!(gate.evaluate(&create_test_signal(PatternType::Iceberg), at(5)).is_ok());
        assert_eq!(gate.stats(at(5)).breaker_trips, 1);
    }

    #[test]
    fn test_breakers_disabled() {
        let mut config = RiskConfig::default();
        config.circuit_breakers.enabled = false;
        let mut gate = create_test_gate(config);
        for i in 0..10 {
            assert!(gate.record_outcome(dec!(-10), at(i)).is_empty());
        }
        assert!(!gate.is_halted(at(10)));
    }

    #[test]
    fn test_regime_update_adjusts_limits() {
        let mut gate = create_test_gate(RiskConfig::default());
        assert!(gate.update_regime(Instrument::Wdo, MarketRegime::Quiet, at(1)));
        assert!(!gate.update_regime(Instrument::Wdo, MarketRegime::Quiet, at(2)));
        assert_eq!(gate.regime(Instrument::Wdo), MarketRegime::Quiet);

        // quiet plus divergent pair: 0.35 * 1.5 * 1.1
        assert!((gate.limits().quality_threshold - 0.5775).abs() < 1e-9);
        let events = gate.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "regime_changed");
    }

    #[test]
    fn test_risk_level_tracks_loss_streak() {
        let mut gate = create_test_gate(RiskConfig::default());
        assert_eq!(gate.risk_level(at(0)), RiskLevel::Low);
        for i in 0..4 {
            gate.record_outcome(dec!(-1), at(i));
        }
        // 4/5 * 0.4 + tiny daily loss
        assert_eq!(gate.risk_level(at(5)), RiskLevel::Low);

        let mut config = RiskConfig::default();
        config.circuit_breakers.daily_loss_limit = dec!(10);
        let mut gate = create_test_gate(config);
        gate.record_outcome(dec!(9), at(1));
        gate.record_outcome(dec!(-17), at(2));
        // drawdown 188% already tripped the drawdown breaker
        assert_eq!(gate.risk_level(at(3)), RiskLevel::Critical);
    }
}
