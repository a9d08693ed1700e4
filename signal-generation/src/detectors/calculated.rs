// Calculated-market proximity: WDO and DOL against the fair-value ladder

use common::{Instrument, PatternSignal, PatternType, SignalDirection};
use serde_json::json;

use super::{DetectionContext, DetectionResult};
use crate::calculated_market::LevelKind;
use crate::config::CalculatedDetectorConfig;

#[derive(Debug, Clone)]
pub struct CalculatedLevelDetector {
    config: CalculatedDetectorConfig,
}

impl CalculatedLevelDetector {
    pub fn new(config: CalculatedDetectorConfig) -> Self {
        Self { config }
    }

    pub fn detect(&self, ctx: &DetectionContext<'_>, instrument: Instrument) -> DetectionResult {
        // missing or expired ladder suppresses the pattern
        let Some(calculated) = ctx.calculated else {
            return Ok(None);
        };
        let own = ctx.instrument(instrument);
        let paired = ctx.instrument(instrument.paired());
        let (Some(price), Some(paired_price)) = (own.last_price(), paired.last_price()) else {
            return Ok(None);
        };

        let Some(own_level) = calculated.nearest(price).filter(|p| p.within_tolerance) else {
            return Ok(None);
        };
        let level = own_level.level;
        let paired_distance = (paired_price - level.price_f64()).abs();
        let pattern = if paired_distance <= calculated.tolerance {
            PatternType::CalculatedConfluence
        } else {
            PatternType::CalculatedDivergence
        };

        let direction = match level.kind {
            LevelKind::Resistance => SignalDirection::Short,
            LevelKind::Support => SignalDirection::Long,
            LevelKind::Pivot => {
                let flow: i64 = own
                    .recent_trades(self.config.flow_lookback_trades)
                    .map(|t| t.signed_volume())
                    .sum();
                // a pivot without flow bias gives no side to take
                if flow == 0 {
                    return Ok(None);
                }
                SignalDirection::from_signed(flow as f64)
            }
        };

        let levels = calculated.ladder.stops_and_targets(
            direction,
            price,
            calculated.stop_buffer,
            calculated.fallback_offset,
        );
        let strength = 0.4 + 0.2 * f64::from(level.strength);
        let mut confidence = match pattern {
            PatternType::CalculatedConfluence => 0.7,
            _ => 0.6,
        };
        if calculated.in_fixing_window {
            confidence = (confidence + calculated.fixing_confidence_boost).min(0.95);
        }

        let mut signal = PatternSignal::new(pattern, instrument, direction, price, ctx.market.timestamp)
            .with_strength(strength)
            .with_confidence(confidence)
            .with_evidence(json!({
                "level": level.name,
                "level_price": level.price_f64(),
                "level_kind": level.kind,
                "level_strength": level.strength,
                "distance": own_level.distance,
                "paired_price": paired_price,
                "paired_distance": paired_distance,
                "pivot": calculated.ladder.pivot.to_string(),
                "stop": levels.stop,
                "target": levels.target,
            }));
        if calculated.in_fixing_window {
            signal.annotate("fixing_window");
        }
        if calculated.stale {
            signal.annotate("stale_ladder");
        }
        Ok(Some(signal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculated_market::CalculatedMarketModule;
    use crate::config::{CalculatedMarketConfig, MarketStateConfig};
    use crate::market_state::RollingMarketState;
    use chrono::{DateTime, TimeZone, Utc};
    use common::{Side, Trade};
    use rust_decimal_macros::dec;

    fn at(hour: u32, min: u32, sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, hour, min, sec).unwrap()
    }

    fn create_test_module() -> CalculatedMarketModule {
        let mut module = CalculatedMarketModule::new(CalculatedMarketConfig {
            differential: dec!(0),
            ..CalculatedMarketConfig::default()
        });
        module.apply_rate(dec!(5.0), at(9, 0, 0));
        module
    }

    fn evaluate(wdo: f64, dol: f64, time: DateTime<Utc>) -> Vec<PatternSignal> {
        evaluate_trades(
            vec![
                Trade::new(time, Instrument::Wdo, Side::Buy, wdo, 5),
                Trade::new(time, Instrument::Dol, Side::Buy, dol, 5),
            ],
            time,
        )
    }

    fn evaluate_trades(trades: Vec<Trade>, time: DateTime<Utc>) -> Vec<PatternSignal> {
        let mut state = RollingMarketState::new(MarketStateConfig::default());
        for trade in trades {
            state.append_trade(trade).unwrap();
        }
        let market = state.snapshot();
        let module = create_test_module();
        let calculated = module.snapshot(time).unwrap();
        let ctx = DetectionContext {
            market: &market,
            calculated: Some(&calculated),
        };

        let detector = CalculatedLevelDetector::new(CalculatedDetectorConfig::default());
        Instrument::ALL
            .iter()
            .filter_map(|i| detector.detect(&ctx, *i).unwrap())
            .collect()
    }

    #[test]
    fn test_divergence_when_only_one_instrument_at_level() {
        // strong_overbought at 5015.625
        let signals = evaluate(5016.0, 5040.0, at(9, 30, 0));
        assert_eq!(signals.len(), 1);
        let signal = &signals[0];
        assert_eq!(signal.pattern, PatternType::CalculatedDivergence);
        assert_eq!(signal.instrument, Instrument::Wdo);
        assert_eq!(signal.direction, SignalDirection::Short);
        assert_eq!(signal.evidence["level"], "strong_overbought");
        assert!(signal.annotations.is_empty());
    }

    #[test]
    fn test_confluence_when_both_at_same_level() {
        let signals = evaluate(4990.5, 4989.0, at(10, 5, 0));
        assert_eq!(signals.len(), 2);
        assert!(signals.iter().all(|s| s.pattern == PatternType::CalculatedConfluence));
        assert!(signals.iter().all(|s| s.direction == SignalDirection::Long));
        // inside the 10:00 fixing window
        assert!((signals[0].confidence() - 0.8).abs() < 1e-9);
        assert_eq!(signals[0].annotations, vec!["fixing_window".to_string()]);
    }

    #[test]
    fn test_pivot_follows_flow_or_stays_silent() {
        let time = at(9, 30, 0);
        let buying = evaluate_trades(
            vec![
                Trade::new(time, Instrument::Wdo, Side::Buy, 5000.0, 5),
                Trade::new(time, Instrument::Dol, Side::Buy, 5040.0, 5),
            ],
            time,
        );
        assert_eq!(buying.len(), 1);
        assert_eq!(buying[0].direction, SignalDirection::Long);
        assert_eq!(buying[0].evidence["level"], "pivot");

        let balanced = evaluate_trades(
            vec![
                Trade::new(time, Instrument::Wdo, Side::Buy, 5000.0, 5),
                Trade::new(time, Instrument::Wdo, Side::Sell, 5000.0, 5),
                Trade::new(time, Instrument::Dol, Side::Buy, 5040.0, 5),
            ],
            time,
        );
        assert!(balanced.is_empty());
    }

    #[test]
    fn test_far_from_ladder() {
        assert!(evaluate(5025.0, 5030.0, at(9, 30, 0)).is_empty());
    }

    #[test]
    fn test_suppressed_without_ladder() {
        let mut state = RollingMarketState::new(MarketStateConfig::default());
        state
            .append_trade(Trade::new(at(9, 30, 0), Instrument::Wdo, Side::Buy, 5016.0, 5))
            .unwrap();
        let market = state.snapshot();
        let ctx = DetectionContext {
            market: &market,
            calculated: None,
        };
        let detector = CalculatedLevelDetector::new(CalculatedDetectorConfig::default());
        assert!(detector.detect(&ctx, Instrument::Wdo).unwrap().is_none());
    }
}
