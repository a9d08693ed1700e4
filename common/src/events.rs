// Observability events
// Everything the pipeline decides besides accepting a signal is reported here

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::market::{BookSide, Instrument};
use crate::signal::PatternType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManipulationKind {
    Layering,
    Spoofing,
}

impl fmt::Display for ManipulationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManipulationKind::Layering => f.write_str("layering"),
            ManipulationKind::Spoofing => f.write_str("spoofing"),
        }
    }
}

/// What the manipulation filter does with candidates once a flag is raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterAction {
    Block,
    Annotate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    Cooldown,
    ManipulationBlocked,
}

/// Terminal state reached by a pending confirmation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationOutcome {
    Confirmed,
    Expired,
    Invalidated { reason: String },
}

impl fmt::Display for ConfirmationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfirmationOutcome::Confirmed => f.write_str("confirmed"),
            ConfirmationOutcome::Expired => f.write_str("expired"),
            ConfirmationOutcome::Invalidated { reason } => write!(f, "invalidated: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ObservabilityEvent {
    InputRejected {
        timestamp: DateTime<Utc>,
        instrument: Instrument,
        reason: String,
        detail: String,
    },
    DetectorFault {
        timestamp: DateTime<Utc>,
        detector: PatternType,
        instrument: Option<Instrument>,
        message: String,
    },
    ManipulationFlagged {
        timestamp: DateTime<Utc>,
        instrument: Instrument,
        kind: ManipulationKind,
        side: BookSide,
        action: FilterAction,
        affected: usize,
        metric: f64,
    },
    CandidateSuppressed {
        timestamp: DateTime<Utc>,
        signal_id: Uuid,
        pattern: PatternType,
        instrument: Instrument,
        reason: SuppressionReason,
    },
    PendingRejected {
        timestamp: DateTime<Utc>,
        signal_id: Uuid,
        pattern: PatternType,
        instrument: Instrument,
        reason: String,
    },
    ConfirmationResolved {
        timestamp: DateTime<Utc>,
        signal_id: Uuid,
        pattern: PatternType,
        instrument: Instrument,
        outcome: ConfirmationOutcome,
    },
    RiskRejected {
        timestamp: DateTime<Utc>,
        signal_id: Uuid,
        pattern: PatternType,
        instrument: Instrument,
        reason: String,
    },
    CircuitBreaker {
        timestamp: DateTime<Utc>,
        breaker: String,
        tripped: bool,
        reason: String,
        until: Option<DateTime<Utc>>,
    },
    LadderRefreshed {
        timestamp: DateTime<Utc>,
        reference_rate: String,
        pivot: String,
        levels: usize,
    },
    LadderStale {
        timestamp: DateTime<Utc>,
        error: String,
        usable: bool,
    },
    DailyReset {
        timestamp: DateTime<Utc>,
    },
    /// An accepted signal the sink could not write
    SinkFailed {
        timestamp: DateTime<Utc>,
        signal_id: Uuid,
        pattern: PatternType,
        instrument: Instrument,
        error: String,
    },
    RegimeChanged {
        timestamp: DateTime<Utc>,
        instrument: Instrument,
        regime: String,
    },
}

impl ObservabilityEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ObservabilityEvent::InputRejected { timestamp, .. }
            | ObservabilityEvent::DetectorFault { timestamp, .. }
            | ObservabilityEvent::ManipulationFlagged { timestamp, .. }
            | ObservabilityEvent::CandidateSuppressed { timestamp, .. }
            | ObservabilityEvent::PendingRejected { timestamp, .. }
            | ObservabilityEvent::ConfirmationResolved { timestamp, .. }
            | ObservabilityEvent::RiskRejected { timestamp, .. }
            | ObservabilityEvent::CircuitBreaker { timestamp, .. }
            | ObservabilityEvent::LadderRefreshed { timestamp, .. }
            | ObservabilityEvent::LadderStale { timestamp, .. }
            | ObservabilityEvent::DailyReset { timestamp }
            | ObservabilityEvent::SinkFailed { timestamp, .. }
            | ObservabilityEvent::RegimeChanged { timestamp, .. } => *timestamp,
        }
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            ObservabilityEvent::InputRejected { .. } => "input_rejected",
            ObservabilityEvent::DetectorFault { .. } => "detector_fault",
            ObservabilityEvent::ManipulationFlagged { .. } => "manipulation_flagged",
            ObservabilityEvent::CandidateSuppressed { .. } => "candidate_suppressed",
            ObservabilityEvent::PendingRejected { .. } => "pending_rejected",
            ObservabilityEvent::ConfirmationResolved { .. } => "confirmation_resolved",
            ObservabilityEvent::RiskRejected { .. } => "risk_rejected",
            ObservabilityEvent::CircuitBreaker { .. } => "circuit_breaker",
            ObservabilityEvent::LadderRefreshed { .. } => "ladder_refreshed",
            ObservabilityEvent::LadderStale { .. } => "ladder_stale",
            ObservabilityEvent::DailyReset { .. } => "daily_reset",
            ObservabilityEvent::SinkFailed { .. } => "sink_failed",
            ObservabilityEvent::RegimeChanged { .. } => "regime_changed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_tag() {
        let event = ObservabilityEvent::ConfirmationResolved {
            timestamp: Utc::now(),
            signal_id: Uuid::new_v4(),
            pattern: PatternType::Absorption,
            instrument: Instrument::Wdo,
            outcome: ConfirmationOutcome::Invalidated {
                reason: "level broken".to_string(),
            },
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "confirmation_resolved");
        assert_eq!(json["pattern"], "absorption");
        assert_eq!(json["outcome"]["invalidated"]["reason"], "level broken");
        assert_eq!(event.name(), "confirmation_resolved");
    }
}
