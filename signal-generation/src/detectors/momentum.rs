// CVD momentum and multi-timeframe delta detectors

use chrono::{DateTime, Duration, Utc};
use common::{PatternSignal, PatternType, Side, SignalDirection};
use serde_json::json;
use statrs::statistics::Statistics;

use super::{ensure_finite, DetectionResult};
use crate::config::{DivergenceConfig, MomentumConfig, MultiframeConfig};
use crate::market_state::InstrumentSnapshot;

/// Price change across the recent trades and their average size
fn price_trend(snapshot: &InstrumentSnapshot, lookback: usize) -> Option<(f64, f64)> {
    let recent: Vec<_> = snapshot.recent_trades(lookback).collect();
    if recent.len() < 2 {
        return None;
    }
    let first = recent.first()?;
    let last = recent.last()?;
    let average_volume = recent.iter().map(|t| t.volume as f64).mean();
    Some((last.price - first.price, average_volume))
}

/// Price and CVD moving in opposite directions
#[derive(Debug, Clone)]
pub struct DivergenceDetector {
    config: DivergenceConfig,
}

impl DivergenceDetector {
    pub fn new(config: DivergenceConfig) -> Self {
        Self { config }
    }

    pub fn detect(&self, snapshot: &InstrumentSnapshot, now: DateTime<Utc>) -> DetectionResult {
        let Some((price_change, average_volume)) = price_trend(snapshot, self.config.lookback_trades) else {
            return Ok(None);
        };
        let roc = ensure_finite(PatternType::Divergence, "cvd_roc", snapshot.cvd_roc)?;

        let direction = if price_change < -self.config.price_threshold && roc >= self.config.roc_threshold {
            SignalDirection::Long
        } else if price_change > self.config.price_threshold && roc <= -self.config.roc_threshold {
            SignalDirection::Short
        } else {
            return Ok(None);
        };

        let Some(price) = snapshot.last_price() else {
            return Ok(None);
        };
        let strength = (roc.abs() / (self.config.roc_threshold * 3.0)).min(1.0);

        Ok(Some(
            PatternSignal::new(PatternType::Divergence, snapshot.instrument, direction, price, now)
                .with_strength(strength)
                .with_confidence(0.55 + 0.2 * strength)
                .with_evidence(json!({
                    "price_change": price_change,
                    "cvd_roc": roc,
                    "cvd": snapshot.cvd,
                    "average_trade_volume": average_volume,
                })),
        ))
    }
}

/// CVD rate-of-change beyond the extreme threshold with price agreeing
#[derive(Debug, Clone)]
pub struct MomentumExtremeDetector {
    config: MomentumConfig,
    trend: DivergenceConfig,
}

impl MomentumExtremeDetector {
    pub fn new(config: MomentumConfig, trend: DivergenceConfig) -> Self {
        Self { config, trend }
    }

    pub fn detect(&self, snapshot: &InstrumentSnapshot, now: DateTime<Utc>) -> DetectionResult {
        let roc = ensure_finite(PatternType::MomentumExtreme, "cvd_roc", snapshot.cvd_roc)?;
        if roc.abs() < self.config.roc_threshold {
            return Ok(None);
        }
        let Some((price_change, _)) = price_trend(snapshot, self.trend.lookback_trades) else {
            return Ok(None);
        };

        // price moving hard against the flow is divergence, not momentum
        if price_change * roc.signum() < -self.trend.price_threshold {
            return Ok(None);
        }

        let direction = SignalDirection::from_signed(roc);
        let Some(price) = snapshot.last_price() else {
            return Ok(None);
        };
        let strength = (roc.abs() / (self.config.roc_threshold * 2.0)).min(1.0);

        Ok(Some(
            PatternSignal::new(PatternType::MomentumExtreme, snapshot.instrument, direction, price, now)
                .with_strength(strength)
                .with_confidence(0.5 + 0.25 * strength)
                .with_evidence(json!({
                    "cvd_roc": roc,
                    "cvd": snapshot.cvd,
                    "price_change": price_change,
                })),
        ))
    }
}

/// Delta share and trade count of one window
#[derive(Debug, Clone, Copy)]
struct WindowDelta {
    delta: f64,
    trades: usize,
}

fn window_deltas(snapshot: &InstrumentSnapshot, windows_secs: &[u64]) -> Vec<WindowDelta> {
    windows_secs
        .iter()
        .map(|secs| {
            let (mut buy, mut sell, mut trades) = (0i64, 0i64, 0usize);
            for trade in snapshot.trades_in_window(Duration::seconds(*secs as i64)) {
                match trade.side {
                    Side::Buy => buy += trade.volume,
                    Side::Sell => sell += trade.volume,
                }
                trades += 1;
            }
            let total = buy + sell;
            let delta = if total > 0 {
                (buy - sell) as f64 / total as f64
            } else {
                0.0
            };
            WindowDelta { delta, trades }
        })
        .collect()
}

/// Micro-window flow against the long-window flow
#[derive(Debug, Clone)]
pub struct MultiframeDivergenceDetector {
    config: MultiframeConfig,
}

impl MultiframeDivergenceDetector {
    pub fn new(config: MultiframeConfig) -> Self {
        Self { config }
    }

    pub fn detect(&self, snapshot: &InstrumentSnapshot, now: DateTime<Utc>) -> DetectionResult {
        let deltas = window_deltas(snapshot, &self.config.windows_secs);
        let (Some(micro), Some(long)) = (deltas.first(), deltas.last()) else {
            return Ok(None);
        };
        if micro.trades < self.config.min_short_trades || long.trades < self.config.min_long_trades {
            return Ok(None);
        }

        let gap = (micro.delta - long.delta).abs();
        let opposite = micro.delta.abs() > self.config.sign_threshold
            && long.delta.abs() > self.config.sign_threshold
            && micro.delta.signum() != long.delta.signum();
        if gap <= self.config.divergence_threshold || !opposite {
            return Ok(None);
        }

        let Some(price) = snapshot.last_price() else {
            return Ok(None);
        };
        Ok(Some(
            PatternSignal::new(
                PatternType::MultiframeDivergence,
                snapshot.instrument,
                SignalDirection::from_signed(micro.delta),
                price,
                now,
            )
            .with_strength(gap / 2.0)
            .with_confidence(0.5 + 0.2 * (gap / 2.0))
            .with_evidence(json!({
                "deltas": deltas.iter().map(|d| d.delta).collect::<Vec<_>>(),
                "trade_counts": deltas.iter().map(|d| d.trades).collect::<Vec<_>>(),
                "micro_delta": micro.delta,
                "long_delta": long.delta,
                "gap": gap,
            })),
        ))
    }
}

/// Most timeframes agreeing strongly on one side
#[derive(Debug, Clone)]
pub struct MultiframeConfluenceDetector {
    config: MultiframeConfig,
}

impl MultiframeConfluenceDetector {
    pub fn new(config: MultiframeConfig) -> Self {
        Self { config }
    }

    pub fn detect(&self, snapshot: &InstrumentSnapshot, now: DateTime<Utc>) -> DetectionResult {
        let deltas = window_deltas(snapshot, &self.config.windows_secs);
        let active: Vec<f64> = deltas
            .iter()
            .filter(|d| d.trades > self.config.confluence_min_trades)
            .map(|d| d.delta)
            .collect();
        if active.len() < self.config.confluence_min_windows {
            return Ok(None);
        }

        let threshold = self.config.confluence_sign_threshold;
        let all_long = active.iter().all(|d| *d > threshold);
        let all_short = active.iter().all(|d| *d < -threshold);
        if !all_long && !all_short {
            return Ok(None);
        }

        let mean = ensure_finite(PatternType::MultiframeConfluence, "mean_delta", active.iter().mean())?;
        if mean.abs() <= self.config.confluence_threshold {
            return Ok(None);
        }

        let Some(price) = snapshot.last_price() else {
            return Ok(None);
        };
        Ok(Some(
            PatternSignal::new(
                PatternType::MultiframeConfluence,
                snapshot.instrument,
                SignalDirection::from_signed(mean),
                price,
                now,
            )
            .with_strength(mean.abs())
            .with_confidence(0.5 + 0.1 * active.len() as f64)
            .with_evidence(json!({
                "deltas": deltas.iter().map(|d| d.delta).collect::<Vec<_>>(),
                "active_windows": active.len(),
                "mean_delta": mean,
            })),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use common::Instrument;

    #[test]
    fn test_bullish_divergence() {
        // price drifts down while buyers lift size: CVD climbs
        let mut trades = vec![create_test_trade(0, Side::Sell, 5005.0, 1)];
        trades.extend((1..10).map(|i| create_test_trade(i, Side::Buy, 5005.0 - i as f64 * 0.5, 20)));
        let market = snapshot_with_trades(trades);
        let wdo = market.instrument(Instrument::Wdo);
        assert!(wdo.cvd_roc >= 50.0);

        let detector = DivergenceDetector::new(DivergenceConfig::default());
        let signal = detector.detect(wdo, market.timestamp).unwrap().unwrap();
        assert_eq!(signal.direction, SignalDirection::Long);
        assert!(signal.evidence_f64("average_trade_volume").is_some());
    }

    #[test]
    fn test_no_divergence_when_price_agrees() {
        let trades = (0..10)
            .map(|i| create_test_trade(i, Side::Buy, 5000.0 + i as f64 * 0.5, 20))
            .collect();
        let market = snapshot_with_trades(trades);
        let detector = DivergenceDetector::new(DivergenceConfig::default());
        assert!(detector
            .detect(market.instrument(Instrument::Wdo), market.timestamp)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_momentum_extreme() {
        let trades = (0..10)
            .map(|i| create_test_trade(i, Side::Sell, 5000.0 - i as f64 * 0.5, 15))
            .collect();
        let market = snapshot_with_trades(trades);

        let detector = MomentumExtremeDetector::new(MomentumConfig::default(), DivergenceConfig::default());
        let signal = detector
            .detect(market.instrument(Instrument::Wdo), market.timestamp)
            .unwrap()
            .unwrap();
        assert_eq!(signal.direction, SignalDirection::Short);
        assert_eq!(signal.evidence_f64("cvd_roc"), Some(-150.0));
    }

    #[test]
    fn test_multiframe_confluence() {
        // steady buying over the last half hour
        let trades = (0..180)
            .map(|i| create_test_trade(i * 10, Side::Buy, 5000.0, 2))
            .collect();
        let market = snapshot_with_trades(trades);

        let detector = MultiframeConfluenceDetector::new(MultiframeConfig::default());
        let signal = detector
            .detect(market.instrument(Instrument::Wdo), market.timestamp)
            .unwrap()
            .unwrap();
        assert_eq!(signal.direction, SignalDirection::Long);
        assert_eq!(signal.evidence_f64("mean_delta"), Some(1.0));
    }

    #[test]
    fn test_multiframe_divergence() {
        // half an hour of buying, then the last minute is all selling
        let mut trades: Vec<_> = (0..170)
            .map(|i| create_test_trade(i * 10, Side::Buy, 5000.0, 5))
            .collect();
        trades.extend((0..12).map(|i| create_test_trade(1700 + i * 5, Side::Sell, 4999.0, 5)));
        let market = snapshot_with_trades(trades);

        let detector = MultiframeDivergenceDetector::new(MultiframeConfig::default());
        let signal = detector
            .detect(market.instrument(Instrument::Wdo), market.timestamp)
            .unwrap()
            .unwrap();
        assert_eq!(signal.direction, SignalDirection::Short);
        assert!(signal.evidence_f64("gap").unwrap() > 0.3);
    }
}
