// Footprint detectors: liquidity defended or hidden at a price level

use chrono::{DateTime, Duration, Utc};
use common::{PatternSignal, PatternType, Side, SignalDirection, Trade};
use serde_json::json;
use statrs::statistics::Statistics;
use std::collections::BTreeMap;

use super::{ensure_finite, price_key, DetectionResult};
use crate::config::{AbsorptionConfig, HiddenLiquidityConfig, IcebergConfig, InstitutionalConfig};
use crate::market_state::InstrumentSnapshot;

/// Volume traded at one price
#[derive(Debug, Default, Clone, Copy)]
struct LevelFlow {
    price: f64,
    buy_volume: i64,
    sell_volume: i64,
    trades: usize,
}

impl LevelFlow {
    fn volume(&self) -> i64 {
        self.buy_volume + self.sell_volume
    }

    fn add(&mut self, trade: &Trade) {
        self.price = trade.price;
        match trade.side {
            Side::Buy => self.buy_volume += trade.volume,
            Side::Sell => self.sell_volume += trade.volume,
        }
        self.trades += 1;
    }

    /// The resting side that absorbed the aggression
    /// Side the resting liquidity defends; `None` when flow is balanced
    fn defended_direction(&self) -> Option<SignalDirection> {
        if self.sell_volume > self.buy_volume {
            Some(SignalDirection::Long)
        } else if self.buy_volume > self.sell_volume {
            Some(SignalDirection::Short)
        } else {
            None
        }
    }
}

fn group_by_price<'a>(trades: impl Iterator<Item = &'a Trade>) -> BTreeMap<i64, LevelFlow> {
    let mut levels: BTreeMap<i64, LevelFlow> = BTreeMap::new();
    for trade in trades {
        levels.entry(price_key(trade.price)).or_default().add(trade);
    }
    levels
}

/// Heavy volume concentrated at one level while price stays in a tight range
#[derive(Debug, Clone)]
pub struct AbsorptionDetector {
    config: AbsorptionConfig,
}

impl AbsorptionDetector {
    pub fn new(config: AbsorptionConfig) -> Self {
        Self { config }
    }

    pub fn detect(&self, snapshot: &InstrumentSnapshot, now: DateTime<Utc>) -> DetectionResult {
        let window: Vec<&Trade> = snapshot
            .trades_in_window(Duration::seconds(self.config.window_secs as i64))
            .collect();
        if window.is_empty() {
            return Ok(None);
        }

        let total: i64 = window.iter().map(|t| t.volume).sum();
        let (low, high) = window.iter().fold((f64::MAX, f64::MIN), |(lo, hi), t| {
            (lo.min(t.price), hi.max(t.price))
        });
        let range = high - low;
        if range > self.config.max_range {
            return Ok(None);
        }

        let levels = group_by_price(window.iter().copied());
        let Some(level) = levels.values().max_by_key(|l| l.volume()) else {
            return Ok(None);
        };
        let concentration = level.volume() as f64 / total as f64;
        if level.volume() < self.config.min_level_volume || concentration < self.config.concentration {
            return Ok(None);
        }

        let Some(direction) = level.defended_direction() else {
            return Ok(None);
        };
        let average_volume = ensure_finite(
            PatternType::Absorption,
            "average_trade_volume",
            window.iter().map(|t| t.volume as f64).mean(),
        )?;

        Ok(Some(
            PatternSignal::new(PatternType::Absorption, snapshot.instrument, direction, level.price, now)
                .with_strength(concentration)
                .with_confidence(0.5 + 0.3 * concentration)
                .with_evidence(json!({
                    "level": level.price,
                    "level_volume": level.volume(),
                    "buy_volume": level.buy_volume,
                    "sell_volume": level.sell_volume,
                    "concentration": concentration,
                    "price_range": range,
                    "average_trade_volume": average_volume,
                })),
        ))
    }
}

/// Repeated large fills at one price: a refilling hidden order
#[derive(Debug, Clone)]
pub struct IcebergDetector {
    config: IcebergConfig,
}

impl IcebergDetector {
    pub fn new(config: IcebergConfig) -> Self {
        Self { config }
    }

    pub fn detect(&self, snapshot: &InstrumentSnapshot, now: DateTime<Utc>) -> DetectionResult {
        let large = snapshot
            .trades_in_window(Duration::seconds(self.config.window_secs as i64))
            .filter(|t| t.volume >= self.config.min_volume);
        let levels = group_by_price(large);

        let Some(level) = levels
            .values()
            .filter(|l| l.trades >= self.config.min_repetitions)
            .max_by_key(|l| (l.trades, l.volume()))
        else {
            return Ok(None);
        };

        // aggressors buying into it means a hidden seller
        let Some(direction) = level.defended_direction() else {
            return Ok(None);
        };
        let repetitions = level.trades as f64 / self.config.min_repetitions as f64;

        Ok(Some(
            PatternSignal::new(PatternType::Iceberg, snapshot.instrument, direction, level.price, now)
                .with_strength((repetitions / 2.0).min(1.0))
                .with_confidence(0.55 + 0.1 * (repetitions - 1.0).min(2.0))
                .with_evidence(json!({
                    "level": level.price,
                    "repetitions": level.trades,
                    "total_volume": level.volume(),
                    "buy_volume": level.buy_volume,
                    "sell_volume": level.sell_volume,
                })),
        ))
    }
}

/// Sizes, rhythm and bias typical of an institutional execution algorithm
#[derive(Debug, Clone)]
pub struct InstitutionalFootprintDetector {
    config: InstitutionalConfig,
}

impl InstitutionalFootprintDetector {
    pub fn new(config: InstitutionalConfig) -> Self {
        Self { config }
    }

    fn size_score(&self, trades: &[&Trade]) -> f64 {
        let repeated: usize = self
            .config
            .sizes
            .iter()
            .map(|size| {
                let tolerance = *size as f64 * self.config.size_tolerance;
                trades
                    .iter()
                    .filter(|t| ((t.volume - size) as f64).abs() <= tolerance)
                    .count()
            })
            .filter(|count| *count >= self.config.min_repeats)
            .sum();
        (repeated as f64 / trades.len() as f64).min(1.0)
    }

    /// 1 for perfectly regular spacing, falling with the coefficient of variation
    fn rhythm_score(trades: &[&Trade]) -> f64 {
        let intervals: Vec<f64> = trades
            .windows(2)
            .map(|w| (w[1].timestamp - w[0].timestamp).num_milliseconds() as f64 / 1000.0)
            .collect();
        let mean = intervals.iter().mean();
        if mean.is_nan() || mean <= 0.0 {
            return 0.0;
        }
        let cv = intervals.iter().population_std_dev() / mean;
        (1.0 - cv).max(0.0)
    }

    pub fn detect(&self, snapshot: &InstrumentSnapshot, now: DateTime<Utc>) -> DetectionResult {
        let trades: Vec<&Trade> = snapshot
            .trades_in_window(Duration::seconds(self.config.window_secs as i64))
            .collect();
        if trades.len() < self.config.min_trades {
            return Ok(None);
        }

        let total: i64 = trades.iter().map(|t| t.volume).sum();
        let in_range: i64 = trades
            .iter()
            .filter(|t| (self.config.range_min..=self.config.range_max).contains(&t.volume))
            .map(|t| t.volume)
            .sum();
        let range_share = in_range as f64 / total as f64;
        if range_share < self.config.min_range_share {
            return Ok(None);
        }

        let signed: i64 = trades.iter().map(|t| t.signed_volume()).sum();
        let bias = signed as f64 / total as f64;
        let size_score = self.size_score(&trades);
        let rhythm_score = Self::rhythm_score(&trades);

        let score = ensure_finite(
            PatternType::InstitutionalFootprint,
            "score",
            0.3 * size_score + 0.2 * rhythm_score + 0.3 * range_share + 0.2 * bias.abs(),
        )?;
        if score < self.config.min_score {
            return Ok(None);
        }

        let Some(price) = snapshot.last_price() else {
            return Ok(None);
        };
        Ok(Some(
            PatternSignal::new(
                PatternType::InstitutionalFootprint,
                snapshot.instrument,
                SignalDirection::from_signed(bias),
                price,
                now,
            )
            .with_strength(score)
            .with_confidence(0.5 + 0.3 * score)
            .with_evidence(json!({
                "score": score,
                "size_score": size_score,
                "rhythm_score": rhythm_score,
                "range_share": range_share,
                "bias": bias,
                "range_min": self.config.range_min,
                "range_max": self.config.range_max,
            })),
        ))
    }
}

/// Executed volume at a level well above what the book ever showed there
#[derive(Debug, Clone)]
pub struct HiddenLiquidityDetector {
    config: HiddenLiquidityConfig,
}

impl HiddenLiquidityDetector {
    pub fn new(config: HiddenLiquidityConfig) -> Self {
        Self { config }
    }

    fn reloads(&self, trades: &[&Trade]) -> usize {
        let max_gap = Duration::milliseconds((self.config.reload_gap_secs * 1000.0) as i64);
        trades
            .windows(2)
            .filter(|w| w[1].timestamp - w[0].timestamp <= max_gap)
            .count()
    }

    pub fn detect(&self, snapshot: &InstrumentSnapshot, now: DateTime<Utc>) -> DetectionResult {
        let Some(book) = snapshot.latest_book() else {
            return Ok(None);
        };
        let recent: Vec<&Trade> = snapshot.recent_trades(self.config.recent_trades).collect();
        let levels = group_by_price(recent.iter().copied());

        // (level, executed, visible, hidden, reloads)
        let mut best: Option<(LevelFlow, i64, i64, usize)> = None;
        for level in levels.values() {
            let executed = level.volume();
            let visible = book.visible_volume_near(level.price, self.config.level_tolerance);
            let hidden = executed - visible;
            if (executed as f64) < self.config.excess_ratio * visible as f64 || hidden < self.config.min_hidden_volume {
                continue;
            }

            let at_level: Vec<&Trade> = recent
                .iter()
                .copied()
                .filter(|t| (t.price - level.price).abs() <= self.config.level_tolerance)
                .collect();
            let reloads = self.reloads(&at_level);
            if reloads < self.config.min_reloads {
                continue;
            }
            if best.map_or(true, |(_, _, h, _)| hidden > h) {
                best = Some((*level, visible, hidden, reloads));
            }
        }

        let Some((level, visible, hidden, reloads)) = best else {
            return Ok(None);
        };
        let Some(direction) = level.defended_direction() else {
            return Ok(None);
        };
        let strength = (hidden as f64 / (self.config.min_hidden_volume as f64 * 3.0)).min(1.0);

        Ok(Some(
            PatternSignal::new(PatternType::HiddenLiquidity, snapshot.instrument, direction, level.price, now)
                .with_strength(strength)
                .with_confidence(0.5 + 0.2 * strength)
                .with_evidence(json!({
                    "level": level.price,
                    "executed_volume": level.volume(),
                    "visible_volume": visible,
                    "hidden_volume": hidden,
                    "reloads": reloads,
                    "level_tolerance": self.config.level_tolerance,
                })),
        ))
    }
}
