// Trap detector: failed breakouts of the prior trading range

use chrono::{DateTime, Utc};
use common::{PatternSignal, PatternType, SignalDirection, Trade};
use serde_json::json;

use super::{ensure_finite, DetectionResult};
use crate::config::TrapConfig;
use crate::market_state::InstrumentSnapshot;

/// Prior range from trades [-50, -10), breakout searched in [-20, -5)
const RANGE_START: usize = 50;
const RANGE_END: usize = 10;
const BREAKOUT_START: usize = 20;
const BREAKOUT_END: usize = 5;

#[derive(Debug, Clone)]
pub struct TrapDetector {
    config: TrapConfig,
}

#[derive(Debug, Clone, Copy)]
struct Breakout {
    direction: SignalDirection,
    broken_level: f64,
    extreme: f64,
    size_pct: f64,
    retrace: f64,
}

impl TrapDetector {
    pub fn new(config: TrapConfig) -> Self {
        Self { config }
    }

    fn slice_range<'a>(trades: &'a [&'a Trade], from_end: usize, to_end: usize) -> &'a [&'a Trade] {
        let len = trades.len();
        &trades[len - from_end..len - to_end]
    }

    pub fn detect(&self, snapshot: &InstrumentSnapshot, now: DateTime<Utc>) -> DetectionResult {
        if snapshot.trades.len() < self.config.min_trades.max(RANGE_START) {
            return Ok(None);
        }
        let trades: Vec<&Trade> = snapshot.recent_trades(RANGE_START).collect();
        let Some(last) = trades.last() else {
            return Ok(None);
        };

        let range = Self::slice_range(&trades, RANGE_START, RANGE_END);
        let range_high = range.iter().map(|t| t.price).fold(f64::MIN, f64::max);
        let range_low = range.iter().map(|t| t.price).fold(f64::MAX, f64::min);

        let window = Self::slice_range(&trades, BREAKOUT_START, BREAKOUT_END);
        let breakout_high = window.iter().map(|t| t.price).fold(f64::MIN, f64::max);
        let breakout_low = window.iter().map(|t| t.price).fold(f64::MAX, f64::min);

        let mut candidates = Vec::with_capacity(2);
        if breakout_high > range_high * (1.0 + self.config.breakout_pct) {
            candidates.push(Breakout {
                // bull trap fades back down
                direction: SignalDirection::Short,
                broken_level: range_high,
                extreme: breakout_high,
                size_pct: (breakout_high - range_high) / range_high,
                retrace: (breakout_high - last.price) / (breakout_high - range_high),
            });
        }
        if breakout_low < range_low * (1.0 - self.config.breakout_pct) {
            candidates.push(Breakout {
                direction: SignalDirection::Long,
                broken_level: range_low,
                extreme: breakout_low,
                size_pct: (range_low - breakout_low) / range_low,
                retrace: (last.price - breakout_low) / (range_low - breakout_low),
            });
        }

        let Some(trap) = candidates
            .into_iter()
            .filter(|b| b.retrace > self.config.min_retrace)
            .max_by(|a, b| a.size_pct.total_cmp(&b.size_pct))
        else {
            return Ok(None);
        };
        let retrace = ensure_finite(PatternType::Trap, "retrace", trap.retrace)?;
        let stop_hunt = trap.size_pct <= self.config.stop_hunt_pct;

        Ok(Some(
            PatternSignal::new(PatternType::Trap, snapshot.instrument, trap.direction, last.price, now)
                .with_strength(retrace.min(1.0))
                .with_confidence(if stop_hunt { 0.65 } else { 0.55 })
                .with_evidence(json!({
                    "broken_level": trap.broken_level,
                    "extreme": trap.extreme,
                    "breakout_pct": trap.size_pct,
                    "retrace": retrace,
                    "stop_hunt": stop_hunt,
                })),
        ))
    }
}
