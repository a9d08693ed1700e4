// Order-flow detectors: pressure, volume spikes and pace anomalies

use chrono::{DateTime, Duration, Utc};
use common::{DetectorError, PatternSignal, PatternType, Side, SignalDirection};
use serde_json::json;
use statrs::statistics::Statistics;

use super::{ensure_finite, DetectionResult};
use crate::config::{PaceConfig, PressureConfig, VolumeSpikeConfig};
use crate::market_state::InstrumentSnapshot;

/// One side dominating the recent trades
#[derive(Debug, Clone)]
pub struct PressureDetector {
    config: PressureConfig,
}

impl PressureDetector {
    pub fn new(config: PressureConfig) -> Self {
        Self { config }
    }

    pub fn detect(&self, snapshot: &InstrumentSnapshot, now: DateTime<Utc>) -> DetectionResult {
        let (mut buy_volume, mut sell_volume, mut count) = (0i64, 0i64, 0usize);
        for trade in snapshot.recent_trades(self.config.lookback_trades) {
            match trade.side {
                Side::Buy => buy_volume += trade.volume,
                Side::Sell => sell_volume += trade.volume,
            }
            count += 1;
        }

        let total = buy_volume + sell_volume;
        if total < self.config.min_volume || total == 0 {
            return Ok(None);
        }

        let (dominant, direction) = if buy_volume >= sell_volume {
            (buy_volume, SignalDirection::Long)
        } else {
            (sell_volume, SignalDirection::Short)
        };
        let share = dominant as f64 / total as f64;
        if share < self.config.min_share {
            return Ok(None);
        }

        let Some(price) = snapshot.last_price() else {
            return Ok(None);
        };
        let excess = (share - self.config.min_share) / (1.0 - self.config.min_share).max(f64::EPSILON);

        Ok(Some(
            PatternSignal::new(PatternType::Pressure, snapshot.instrument, direction, price, now)
                .with_strength(share)
                .with_confidence(0.5 + 0.4 * excess)
                .with_evidence(json!({
                    "buy_volume": buy_volume,
                    "sell_volume": sell_volume,
                    "total_volume": total,
                    "share": share,
                    "trades": count,
                })),
        ))
    }
}

/// Recent trade sizes far above the preceding average
#[derive(Debug, Clone)]
pub struct VolumeSpikeDetector {
    config: VolumeSpikeConfig,
}

impl VolumeSpikeDetector {
    pub fn new(config: VolumeSpikeConfig) -> Self {
        Self { config }
    }

    pub fn detect(&self, snapshot: &InstrumentSnapshot, now: DateTime<Utc>) -> DetectionResult {
        let recent_count = self.config.recent_trades;
        let total = snapshot.trades.len();
        if recent_count == 0 || total < recent_count + self.config.min_history {
            return Ok(None);
        }

        let split = total - recent_count;
        let history = snapshot.trades.range(..split).map(|t| t.volume as f64).mean();
        let recent: Vec<_> = snapshot.trades.range(split..).collect();
        let recent_avg = recent.iter().map(|t| t.volume as f64).mean();

        let history = ensure_finite(PatternType::VolumeSpike, "history_average", history)?;
        if history <= 0.0 {
            return Ok(None);
        }
        let ratio = recent_avg / history;
        if ratio < self.config.multiplier {
            return Ok(None);
        }

        let signed: i64 = recent.iter().map(|t| t.signed_volume()).sum();
        let direction = SignalDirection::from_signed(signed as f64);
        let Some(price) = snapshot.last_price() else {
            return Ok(None);
        };

        Ok(Some(
            PatternSignal::new(PatternType::VolumeSpike, snapshot.instrument, direction, price, now)
                .with_strength(ratio / (self.config.multiplier * 2.0))
                .with_confidence(0.55)
                .with_evidence(json!({
                    "recent_average": recent_avg,
                    "history_average": history,
                    "ratio": ratio,
                    "signed_volume": signed,
                })),
        ))
    }
}

/// Trade count in the current window far from the baseline windows
#[derive(Debug, Clone)]
pub struct PaceAnomalyDetector {
    config: PaceConfig,
}

impl PaceAnomalyDetector {
    pub fn new(config: PaceConfig) -> Self {
        Self { config }
    }

    pub fn detect(&self, snapshot: &InstrumentSnapshot, now: DateTime<Utc>) -> DetectionResult {
        if self.config.window_secs == 0 {
            return Err(DetectorError::Internal {
                detector: PatternType::PaceAnomaly,
                message: "pace window must be positive".to_string(),
            });
        }
        let (Some(first), Some(last)) = (snapshot.trades.front(), snapshot.trades.back()) else {
            return Ok(None);
        };

        let window = Duration::seconds(self.config.window_secs as i64);
        let end = last.timestamp;
        let count_between = |from: DateTime<Utc>, to: DateTime<Utc>| {
            let start = snapshot.trades.partition_point(|t| t.timestamp <= from);
            let stop = snapshot.trades.partition_point(|t| t.timestamp <= to);
            stop - start
        };

        let current = count_between(end - window, end);
        let mut baseline = Vec::new();
        for k in 1..=self.config.max_baseline_windows as i32 {
            let to = end - window * k;
            let from = to - window;
            if from < first.timestamp {
                break;
            }
            baseline.push(count_between(from, to) as f64);
        }
        if baseline.len() < self.config.min_baseline_windows {
            return Ok(None);
        }

        let mean = baseline.iter().mean();
        let std_dev = baseline.iter().population_std_dev();
        // a flat baseline has no spread to measure against
        if !(std_dev > 0.0) {
            return Ok(None);
        }
        let z_score = ensure_finite(PatternType::PaceAnomaly, "z_score", (current as f64 - mean) / std_dev)?;
        if z_score.abs() <= self.config.std_threshold {
            return Ok(None);
        }

        let signed: i64 = snapshot.trades_since(end - window).map(|t| t.signed_volume()).sum();
        let direction = SignalDirection::from_signed(signed as f64);

        Ok(Some(
            PatternSignal::new(PatternType::PaceAnomaly, snapshot.instrument, direction, last.price, now)
                .with_strength(z_score.abs() / (self.config.std_threshold * 2.0))
                .with_confidence(0.45)
                .with_evidence(json!({
                    "current_count": current,
                    "baseline_mean": mean,
                    "baseline_std": std_dev,
                    "z_score": z_score,
                    "baseline_windows": baseline.len(),
                })),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    fn pressure_trades(buys: i64) -> Vec<common::Trade> {
        (0..10)
            .map(|i| {
                let side = if i < buys { Side::Buy } else { Side::Sell };
                create_test_trade(i, side, 5000.0, 10)
            })
            .collect()
    }

    #[test]
    fn test_pressure_above_threshold() {
        let market = snapshot_with_trades(pressure_trades(8));
        let detector = PressureDetector::new(PressureConfig::default());

        let signal = detector
            .detect(market.instrument(common::Instrument::Wdo), market.timestamp)
            .unwrap()
            .unwrap();
        assert_eq!(signal.pattern, PatternType::Pressure);
        assert_eq!(signal.direction, SignalDirection::Long);
        assert_eq!(signal.evidence_f64("share"), Some(0.8));
    }

    #[test]
    fn test_pressure_below_threshold() {
        let market = snapshot_with_trades(pressure_trades(6));
        let detector = PressureDetector::new(PressureConfig::default());
        let result = detector
            .detect(market.instrument(common::Instrument::Wdo), market.timestamp)
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_pressure_needs_minimum_volume() {
        let trades = (0..5).map(|i| create_test_trade(i, Side::Sell, 5000.0, 10)).collect();
        let market = snapshot_with_trades(trades);
        let detector = PressureDetector::new(PressureConfig::default());
        let result = detector
            .detect(market.instrument(common::Instrument::Wdo), market.timestamp)
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_volume_spike() {
        let mut trades: Vec<_> = (0..40).map(|i| create_test_trade(i, Side::Buy, 5000.0, 5)).collect();
        trades.extend((40..50).map(|i| create_test_trade(i, Side::Sell, 4999.0, 20)));
        let market = snapshot_with_trades(trades);

        let detector = VolumeSpikeDetector::new(VolumeSpikeConfig::default());
        let signal = detector
            .detect(market.instrument(common::Instrument::Wdo), market.timestamp)
            .unwrap()
            .unwrap();
        assert_eq!(signal.direction, SignalDirection::Short);
        assert_eq!(signal.evidence_f64("ratio"), Some(4.0));
    }

    #[test]
    fn test_volume_spike_needs_history() {
        let trades = (0..30).map(|i| create_test_trade(i, Side::Buy, 5000.0, 5)).collect();
        let market = snapshot_with_trades(trades);
        let detector = VolumeSpikeDetector::new(VolumeSpikeConfig::default());
        let result = detector
            .detect(market.instrument(common::Instrument::Wdo), market.timestamp)
            .unwrap();
        assert!(result.is_none());
    }

    /// One trade at 0, baseline windows (10, 20] and (0, 10], then `current` trades ending at 30
    fn pace_trades(recent: i64, earlier: i64, current: i64) -> Vec<common::Trade> {
        let mut trades = vec![create_test_trade(0, Side::Buy, 5000.0, 1)];
        trades.extend((0..earlier).map(|_| create_test_trade(5, Side::Buy, 5000.0, 1)));
        trades.extend((0..recent).map(|_| create_test_trade(15, Side::Buy, 5000.0, 1)));
        trades.extend((0..current).map(|i| create_test_trade(30 - i, Side::Buy, 5000.0, 1)));
        trades.sort_by_key(|t| t.timestamp);
        trades
    }

    fn two_window_pace() -> PaceAnomalyDetector {
        PaceAnomalyDetector::new(PaceConfig {
            min_baseline_windows: 2,
            max_baseline_windows: 2,
            ..PaceConfig::default()
        })
    }

    #[test]
    fn test_pace_burst() {
        // one trade every 5 seconds plus an extra one, then a burst
        let mut trades: Vec<_> = (0..20).map(|i| create_test_trade(i * 5, Side::Buy, 5000.0, 1)).collect();
        trades.push(create_test_trade(52, Side::Buy, 5000.0, 1));
        trades.sort_by_key(|t| t.timestamp);
        trades.extend((0..15).map(|_| create_test_trade(100, Side::Buy, 5000.5, 1)));
        let market = snapshot_with_trades(trades);

        let detector = PaceAnomalyDetector::new(PaceConfig::default());
        let signal = detector
            .detect(market.instrument(common::Instrument::Wdo), market.timestamp)
            .unwrap()
            .unwrap();
        assert_eq!(signal.pattern, PatternType::PaceAnomaly);
        assert_eq!(signal.direction, SignalDirection::Long);
        assert!(signal.evidence_f64("z_score").unwrap() > 2.0);
    }

    #[test]
    fn test_pace_regular_flow_is_quiet() {
        let trades = (0..40).map(|i| create_test_trade(i * 5, Side::Buy, 5000.0, 1)).collect();
        let market = snapshot_with_trades(trades);
        let detector = PaceAnomalyDetector::new(PaceConfig::default());
        let result = detector
            .detect(market.instrument(common::Instrument::Wdo), market.timestamp)
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_pace_at_threshold_is_quiet() {
        // baseline [1, 3]: mean 2, deviation 1, so 4 trades sit exactly at 2 deviations
        let market = snapshot_with_trades(pace_trades(1, 3, 4));
        let result = two_window_pace()
            .detect(market.instrument(common::Instrument::Wdo), market.timestamp)
            .unwrap();
        assert!(result.is_none());

        let market = snapshot_with_trades(pace_trades(1, 3, 5));
        let signal = two_window_pace()
            .detect(market.instrument(common::Instrument::Wdo), market.timestamp)
            .unwrap()
            .unwrap();
        assert_eq!(signal.evidence_f64("baseline_std"), Some(1.0));
        assert_eq!(signal.evidence_f64("z_score"), Some(3.0));
    }

    #[test]
    fn test_pace_slowdown_flags_with_window_flow() {
        // baseline [6, 4]: mean 5, deviation 1; a single buy is 4 deviations below
        let market = snapshot_with_trades(pace_trades(6, 4, 1));
        let signal = two_window_pace()
            .detect(market.instrument(common::Instrument::Wdo), market.timestamp)
            .unwrap()
            .unwrap();
        assert_eq!(signal.evidence_f64("z_score"), Some(-4.0));
        assert_eq!(signal.direction, SignalDirection::Long);
    }
}
