//! Circuit breakers, sliding emission windows and risk violations

use chrono::{DateTime, Duration, Utc};
use common::{Instrument, ObservabilityEvent, PatternSignal, PatternType};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

/// Current risk level assessment
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s >= 0.9 => RiskLevel::Critical,
            s if s >= 0.7 => RiskLevel::High,
            s if s >= 0.4 => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }
}

/// The independent breakers guarding admission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerKind {
    ConsecutiveLosses,
    Drawdown,
    DailyLoss,
    /// Manual trip by an operator
    Emergency,
}

impl BreakerKind {
    pub const ALL: [BreakerKind; 4] = [
        BreakerKind::ConsecutiveLosses,
        BreakerKind::Drawdown,
        BreakerKind::DailyLoss,
        BreakerKind::Emergency,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BreakerKind::ConsecutiveLosses => "consecutive_losses",
            BreakerKind::Drawdown => "drawdown",
            BreakerKind::DailyLoss => "daily_loss",
            BreakerKind::Emergency => "emergency",
        }
    }
}

impl fmt::Display for BreakerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A breaker opening or clearing
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerTransition {
    pub kind: BreakerKind,
    pub tripped: bool,
    pub reason: String,
    pub at: DateTime<Utc>,
    pub until: Option<DateTime<Utc>>,
}

impl BreakerTransition {
    pub fn to_event(&self) -> ObservabilityEvent {
        ObservabilityEvent::CircuitBreaker {
            timestamp: self.at,
            breaker: self.kind.to_string(),
            tripped: self.tripped,
            reason: self.reason.clone(),
            until: self.until,
        }
    }
}

/// Circuit breaker for automatic risk limits
///
/// Time is supplied by the caller so replayed sessions trip and clear on the
/// market clock.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    kind: BreakerKind,
    trigger_time: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    reason: Option<String>,
    trips_today: Vec<DateTime<Utc>>,
    cooldown_duration: Duration,
}

impl CircuitBreaker {
    pub fn new(kind: BreakerKind, cooldown_duration: Duration) -> Self {
        Self {
            kind,
            trigger_time: None,
            until: None,
            reason: None,
            trips_today: Vec::new(),
            cooldown_duration,
        }
    }

    pub fn kind(&self) -> BreakerKind {
        self.kind
    }

    /// Trip the breaker; a breaker that is already open stays as it is
    pub fn trigger(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Option<BreakerTransition> {
        if self.is_active(now) {
            return None;
        }

        let reason = reason.into();
        let until = now + self.cooldown_duration;
        self.trigger_time = Some(now);
        self.until = Some(until);
        self.reason = Some(reason.clone());
        self.trips_today.push(now);

        tracing::error!(
            breaker = %self.kind,
            reason = %reason,
            until = %until,
            "Circuit breaker TRIGGERED - Signal emission halted"
        );

        Some(BreakerTransition {
            kind: self.kind,
            tripped: true,
            reason,
            at: now,
            until: Some(until),
        })
    }

    /// Check if circuit breaker is active
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.until.map_or(false, |until| now < until)
    }

    /// Clear the breaker once its cooldown has elapsed
    pub fn refresh(&mut self, now: DateTime<Utc>) -> Option<BreakerTransition> {
        match self.until {
            Some(until) if now >= until => Some(self.clear(now, "cooldown elapsed")),
            _ => None,
        }
    }

    /// Reset the circuit breaker regardless of cooldown
    pub fn reset(&mut self, now: DateTime<Utc>) -> Option<BreakerTransition> {
        if self.until.is_some() {
            Some(self.clear(now, "manual reset"))
        } else {
            None
        }
    }

    fn clear(&mut self, now: DateTime<Utc>, reason: &str) -> BreakerTransition {
        self.trigger_time = None;
        self.until = None;
        self.reason = None;

        tracing::info!(breaker = %self.kind, reason, "Circuit breaker reset - Signal emission resumed");

        BreakerTransition {
            kind: self.kind,
            tripped: false,
            reason: reason.to_string(),
            at: now,
            until: None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn until(&self) -> Option<DateTime<Utc>> {
        self.until
    }

    pub fn triggered_at(&self) -> Option<DateTime<Utc>> {
        self.trigger_time
    }

    /// Number of trips since the last daily reset
    pub fn trips_today(&self) -> usize {
        self.trips_today.len()
    }

    pub fn clear_daily(&mut self) {
        self.trips_today.clear();
    }
}

/// Sliding emission windows and the set of signals still within validity
#[derive(Debug, Clone, Default)]
pub struct RateWindows {
    minute: VecDeque<DateTime<Utc>>,
    hour: VecDeque<DateTime<Utc>>,
    confluence_hour: VecDeque<DateTime<Utc>>,
    active: VecDeque<ActiveSignal>,
}

/// An emitted signal counted against the concurrency limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSignal {
    pub id: Uuid,
    pub pattern: PatternType,
    pub instrument: Instrument,
    pub expires_at: DateTime<Utc>,
}

/// Window occupancy at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCounts {
    pub minute: usize,
    pub hour: usize,
    pub confluence_hour: usize,
    pub active: usize,
}

impl RateWindows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop entries that have slid out of their window
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let minute_start = now - Duration::minutes(1);
        let hour_start = now - Duration::hours(1);

        while self.minute.front().map_or(false, |t| *t <= minute_start) {
            self.minute.pop_front();
        }
        while self.hour.front().map_or(false, |t| *t <= hour_start) {
            self.hour.pop_front();
        }
        while self.confluence_hour.front().map_or(false, |t| *t <= hour_start) {
            self.confluence_hour.pop_front();
        }
        self.active.retain(|s| s.expires_at > now);
    }

    pub fn counts(&self) -> WindowCounts {
        WindowCounts {
            minute: self.minute.len(),
            hour: self.hour.len(),
            confluence_hour: self.confluence_hour.len(),
            active: self.active.len(),
        }
    }

    pub fn record(&mut self, signal: &PatternSignal, now: DateTime<Utc>, validity: Duration) {
        self.minute.push_back(now);
        self.hour.push_back(now);
        if signal.pattern.is_confluence() {
            self.confluence_hour.push_back(now);
        }
        self.active.push_back(ActiveSignal {
            id: signal.id,
            pattern: signal.pattern,
            instrument: signal.instrument,
            expires_at: now + validity,
        });
    }

    /// Release a signal before its validity runs out
    pub fn release(&mut self, signal_id: Uuid) -> bool {
        let before = self.active.len();
        self.active.retain(|s| s.id != signal_id);
        self.active.len() != before
    }

    pub fn active_signals(&self) -> impl Iterator<Item = &ActiveSignal> {
        self.active.iter()
    }

    /// Daily rollover clears the rate windows; live signals stay counted
    pub fn clear_rates(&mut self) {
        self.minute.clear();
        self.hour.clear();
        self.confluence_hour.clear();
    }
}

/// Risk violation types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RiskViolation {
    CircuitBreakerOpen {
        breaker: BreakerKind,
        reason: String,
        until: Option<DateTime<Utc>>,
    },
    MinuteRateExceeded {
        current: usize,
        limit: usize,
    },
    HourRateExceeded {
        current: usize,
        limit: usize,
    },
    ConfluenceRateExceeded {
        current: usize,
        limit: usize,
    },
    MaxConcurrentExceeded {
        current: usize,
        limit: usize,
    },
    QualityBelowThreshold {
        score: f64,
        threshold: f64,
    },
}

impl RiskViolation {
    /// Short machine-readable label
    pub fn kind(&self) -> &'static str {
        match self {
            RiskViolation::CircuitBreakerOpen { .. } => "circuit_breaker_open",
            RiskViolation::MinuteRateExceeded { .. } => "minute_rate",
            RiskViolation::HourRateExceeded { .. } => "hour_rate",
            RiskViolation::ConfluenceRateExceeded { .. } => "confluence_rate",
            RiskViolation::MaxConcurrentExceeded { .. } => "max_concurrent",
            RiskViolation::QualityBelowThreshold { .. } => "quality",
        }
    }

    pub fn to_event(&self, signal: &PatternSignal, now: DateTime<Utc>) -> ObservabilityEvent {
        ObservabilityEvent::RiskRejected {
            timestamp: now,
            signal_id: signal.id,
            pattern: signal.pattern,
            instrument: signal.instrument,
            reason: self.to_string(),
        }
    }
}

impl fmt::Display for RiskViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskViolation::CircuitBreakerOpen { breaker, reason, until } => match until {
                Some(until) => write!(f, "Circuit breaker '{}' open until {}: {}", breaker, until, reason),
                None => write!(f, "Circuit breaker '{}' open: {}", breaker, reason),
            },
            RiskViolation::MinuteRateExceeded { current, limit } => {
                write!(f, "Signals in the last minute {} reached limit {}", current, limit)
            }
            RiskViolation::HourRateExceeded { current, limit } => {
                write!(f, "Signals in the last hour {} reached limit {}", current, limit)
            }
            RiskViolation::ConfluenceRateExceeded { current, limit } => {
                write!(f, "Confluence signals in the last hour {} reached limit {}", current, limit)
            }
            RiskViolation::MaxConcurrentExceeded { current, limit } => {
                write!(f, "Active signals {} reached limit {}", current, limit)
            }
            RiskViolation::QualityBelowThreshold { score, threshold } => {
                write!(f, "Quality score {:.3} below threshold {:.3}", score, threshold)
            }
        }
    }
}

impl std::error::Error for RiskViolation {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common::SignalDirection;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn create_test_signal(pattern: PatternType) -> PatternSignal {
        PatternSignal::new(pattern, Instrument::Wdo, SignalDirection::Long, 5000.0, at(0))
    }

    #[test]
    fn test_risk_level_from_score() {
        assert_eq!(RiskLevel::from_score(0.95), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(0.7), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(0.5), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(0.1), RiskLevel::Low);
    }

    #[test]
    fn test_circuit_breaker() {
        let mut cb = CircuitBreaker::new(BreakerKind::ConsecutiveLosses, Duration::seconds(300));
        assert!(!cb.is_active(at(0)));

        let transition = cb.trigger("5 losses", at(0)).unwrap();
        assert!(transition.tripped);
        assert_eq!(transition.until, Some(at(300)));
        assert!(cb.is_active(at(299)));
        assert_eq!(cb.trips_today(), 1);

        // re-trip while open is a no-op
        assert!(cb.trigger("again", at(100)).is_none());
        assert_eq!(cb.until(), Some(at(300)));

        assert!(cb.refresh(at(200)).is_none());
        assert!(!cb.is_active(at(300)));
        let cleared = cb.refresh(at(300)).unwrap();
        assert!(!cleared.tripped);
        assert!(cb.refresh(at(301)).is_none());
    }

    #[test]
    fn test_breaker_event() {
        let mut cb = CircuitBreaker::new(BreakerKind::Emergency, Duration::seconds(60));
        let event = cb.trigger("operator halt", at(10)).unwrap().to_event();
        match event {
            ObservabilityEvent::CircuitBreaker { breaker, tripped, until, .. } => {
                assert_eq!(breaker, "emergency");
                assert!(tripped);
                assert_eq!(until, Some(at(70)));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(cb.reset(at(20)).is_some());
        assert!(cb.reset(at(21)).is_none());
    }

    #[test]
    fn test_windows_slide() {
        let mut windows = RateWindows::new();
        let validity = Duration::seconds(60);
        for secs in [0, 10, 20] {
            windows.record(&create_test_signal(PatternType::Pressure), at(secs), validity);
        }
        windows.record(&create_test_signal(PatternType::MultiframeConfluence), at(30), validity);

        windows.prune(at(30));
        assert_eq!(
            windows.counts(),
            WindowCounts { minute: 4, hour: 4, confluence_hour: 1, active: 4 }
        );

        // the signal at 0 leaves the minute window at exactly 60s
        windows.prune(at(60));
        assert_eq!(windows.counts().minute, 3);
        assert_eq!(windows.counts().active, 3);
        assert_eq!(windows.counts().hour, 4);

        windows.prune(at(3630));
        assert_eq!(windows.counts(), WindowCounts::default());
    }

    #[test]
    fn test_release_and_daily_clear() {
        let mut windows = RateWindows::new();
        let signal = create_test_signal(PatternType::Iceberg);
        windows.record(&signal, at(0), Duration::seconds(60));
        windows.clear_rates();
        assert_eq!(windows.counts().minute, 0);
        assert_eq!(windows.counts().active, 1);
        assert!(windows.release(signal.id));
        assert!(!windows.release(signal.id));
    }

    #[test]
    fn test_violation_display() {
        let violation = RiskViolation::QualityBelowThreshold { score: 0.2, threshold: 0.35 };
        assert_eq!(violation.to_string(), "Quality score 0.200 below threshold 0.350");
        assert_eq!(violation.kind(), "quality");
    }
}
