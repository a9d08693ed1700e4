//! Operator and strategy feedback into the risk gate
//!
//! Read as JSON lines, one command per line:
//!
//! ```text
//! {"type":"outcome","pnl":"-120.5","signal_id":"..."}
//! {"type":"regime","instrument":"WDO","regime":"volatile"}
//! {"type":"emergency","reason":"exchange halt"}
//! {"type":"reset_breaker","breaker":"emergency"}
//! ```

use chrono::{DateTime, Utc};
use common::{Instrument, Uuid};
use risk_management::{BreakerKind, MarketRegime, RiskGate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Control {
    /// Realized result of a previously emitted signal
    Outcome {
        pnl: Decimal,
        #[serde(default)]
        signal_id: Option<Uuid>,
    },
    Regime {
        instrument: Instrument,
        regime: MarketRegime,
    },
    Emergency {
        reason: String,
    },
    ResetBreaker {
        breaker: BreakerKind,
    },
}

impl Control {
    /// Apply to the gate; its transitions are queued as gate events
    pub fn apply(self, gate: &mut RiskGate, now: DateTime<Utc>) {
        match self {
            Control::Outcome { pnl, signal_id } => {
                if let Some(id) = signal_id {
                    gate.release_signal(id);
                }
                gate.record_outcome(pnl, now);
            }
            Control::Regime { instrument, regime } => {
                gate.update_regime(instrument, regime, now);
            }
            Control::Emergency { reason } => {
                gate.trip_emergency(reason, now);
            }
            Control::ResetBreaker { breaker } => {
                if gate.reset_breaker(breaker, now).is_none() {
                    info!(breaker = %breaker, "Reset requested for a breaker that is not open");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use risk_management::RiskConfig;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 13, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_commands() {
        let outcome: Control = serde_json::from_str(r#"{"type":"outcome","pnl":"-120.5"}"#).unwrap();
        assert_eq!(outcome, Control::Outcome { pnl: dec!(-120.5), signal_id: None });

        let regime: Control =
            serde_json::from_str(r#"{"type":"regime","instrument":"DOL","regime":"volatile"}"#).unwrap();
        assert_eq!(
            regime,
            Control::Regime { instrument: Instrument::Dol, regime: MarketRegime::Volatile }
        );

        let reset: Control = serde_json::from_str(r#"{"type":"reset_breaker","breaker":"emergency"}"#).unwrap();
        assert_eq!(reset, Control::ResetBreaker { breaker: BreakerKind::Emergency });

        assert!(serde_json::from_str::<Control>(r#"{"type":"reboot"}"#).is_err());
    }

    #[test]
    fn test_emergency_and_reset() {
        let mut gate = RiskGate::new(RiskConfig::default()).unwrap();

        Control::Emergency { reason: "exchange halt".to_string() }.apply(&mut gate, now());
        assert!(gate.is_halted(now()));

        Control::ResetBreaker { breaker: BreakerKind::Emergency }.apply(&mut gate, now());
        assert!(!gate.is_halted(now()));

        let names: Vec<&str> = gate.drain_events().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["circuit_breaker", "circuit_breaker"]);
    }

    #[test]
    fn test_outcomes_feed_breakers() {
        let mut gate = RiskGate::new(RiskConfig::default()).unwrap();
        for _ in 0..5 {
            Control::Outcome { pnl: dec!(-10), signal_id: None }.apply(&mut gate, now());
        }
        assert_eq!(gate.outcomes().consecutive_losses, 5);
        assert!(gate.is_halted(now()));
    }
}
