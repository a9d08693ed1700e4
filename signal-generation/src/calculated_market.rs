//! Calculated market: synthetic fair-value ladder for the WDO/DOL pair
//!
//! The ladder is derived from an external reference rate and configured
//! multipliers. Refreshes happen on their own timer; between refreshes the
//! last ladder is served, and after a failed fetch it stays usable until the
//! stale grace period since the last success runs out.

use chrono::{DateTime, Duration, Utc};
use common::{FetchError, ObservabilityEvent, SignalDirection};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::CalculatedMarketConfig;

/// Pivot price from the reference rate
pub trait PivotPricing: Send + Sync {
    fn pivot(&self, reference_rate: Decimal, differential: Decimal) -> Decimal;
}

/// Spot rate quoted per 1000 USD plus the interest differential in points
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardPointsPricing;

impl PivotPricing for ForwardPointsPricing {
    fn pivot(&self, reference_rate: Decimal, differential: Decimal) -> Decimal {
        reference_rate * Decimal::ONE_THOUSAND + differential
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelKind {
    Resistance,
    Support,
    Pivot,
}

/// One named rung of the ladder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LadderLevel {
    pub name: String,
    pub multiplier: Decimal,
    pub price: Decimal,
    pub kind: LevelKind,
    /// 0..=3
    pub strength: u8,
}

impl LadderLevel {
    fn new(name: &str, multiplier: Decimal, pivot: Decimal, volatility_unit: Decimal) -> Self {
        let kind = match multiplier.cmp(&Decimal::ZERO) {
            std::cmp::Ordering::Greater => LevelKind::Resistance,
            std::cmp::Ordering::Less => LevelKind::Support,
            std::cmp::Ordering::Equal => LevelKind::Pivot,
        };
        let strength = (multiplier * Decimal::TWO)
            .trunc()
            .abs()
            .to_u8()
            .unwrap_or(u8::MAX)
            .min(3);

        Self {
            name: name.to_string(),
            multiplier,
            price: pivot + multiplier * volatility_unit,
            kind,
            strength,
        }
    }

    pub fn price_f64(&self) -> f64 {
        self.price.to_f64().unwrap_or(f64::NAN)
    }
}

/// Nearest level to a price
#[derive(Debug, Clone)]
pub struct LevelProximity<'a> {
    pub level: &'a LadderLevel,
    pub distance: f64,
    pub within_tolerance: bool,
}

/// Stop and target prices derived from the ladder
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StopTarget {
    pub stop: f64,
    pub target: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FairValueLadder {
    pub reference_rate: Decimal,
    pub differential: Decimal,
    pub volatility_unit: Decimal,
    pub pivot: Decimal,
    pub levels: Vec<LadderLevel>,
    pub computed_at: DateTime<Utc>,
}

impl FairValueLadder {
    pub fn compute(
        reference_rate: Decimal,
        config: &CalculatedMarketConfig,
        pricing: &dyn PivotPricing,
        computed_at: DateTime<Utc>,
    ) -> Self {
        let pivot = pricing.pivot(reference_rate, config.differential);
        let levels = config
            .levels
            .iter()
            .map(|l| LadderLevel::new(&l.name, l.multiplier, pivot, config.volatility_unit))
            .collect();

        Self {
            reference_rate,
            differential: config.differential,
            volatility_unit: config.volatility_unit,
            pivot,
            levels,
            computed_at,
        }
    }

    pub fn level(&self, name: &str) -> Option<&LadderLevel> {
        self.levels.iter().find(|l| l.name == name)
    }

    /// Nearest level to `price`; ties go to the first configured level
    pub fn nearest(&self, price: f64, tolerance: f64) -> Option<LevelProximity<'_>> {
        let mut best: Option<LevelProximity<'_>> = None;
        for level in &self.levels {
            let distance = (price - level.price_f64()).abs();
            if !distance.is_finite() {
                continue;
            }
            if best.as_ref().map_or(true, |b| distance < b.distance) {
                best = Some(LevelProximity {
                    level,
                    distance,
                    within_tolerance: distance <= tolerance,
                });
            }
        }
        best
    }

    /// Stop beyond the nearest protective level, target at the next opposing one
    pub fn stops_and_targets(
        &self,
        direction: SignalDirection,
        price: f64,
        buffer: f64,
        fallback_offset: f64,
    ) -> StopTarget {
        let supports_below = self
            .levels
            .iter()
            .filter(|l| l.kind == LevelKind::Support)
            .map(LadderLevel::price_f64)
            .filter(|p| *p < price);
        let resistances_above = || {
            self.levels
                .iter()
                .filter(|l| l.kind == LevelKind::Resistance)
                .map(LadderLevel::price_f64)
                .filter(|p| *p > price)
        };

        let nearest_support = supports_below.fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.max(p))));
        let nearest_resistance = resistances_above().fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.min(p))));

        match direction {
            SignalDirection::Short => StopTarget {
                stop: nearest_resistance.map_or(price + fallback_offset, |r| r + buffer),
                target: nearest_support.unwrap_or(price - fallback_offset),
            },
            _ => StopTarget {
                stop: nearest_support.map_or(price - fallback_offset, |s| s - buffer),
                target: nearest_resistance.unwrap_or(price + fallback_offset),
            },
        }
    }
}

/// Ladder as seen by detectors for one cycle
#[derive(Debug, Clone)]
pub struct CalculatedSnapshot {
    pub ladder: Arc<FairValueLadder>,
    pub stale: bool,
    pub tolerance: f64,
    pub in_fixing_window: bool,
    pub stop_buffer: f64,
    pub fallback_offset: f64,
    pub fixing_confidence_boost: f64,
}

impl CalculatedSnapshot {
    pub fn nearest(&self, price: f64) -> Option<LevelProximity<'_>> {
        self.ladder.nearest(price, self.tolerance)
    }
}

/// Owner of the current ladder and its freshness
pub struct CalculatedMarketModule {
    config: CalculatedMarketConfig,
    pricing: Box<dyn PivotPricing>,
    ladder: Option<Arc<FairValueLadder>>,
    last_success: Option<DateTime<Utc>>,
    stale: bool,
}

impl CalculatedMarketModule {
    pub fn new(config: CalculatedMarketConfig) -> Self {
        Self::with_pricing(config, Box::new(ForwardPointsPricing))
    }

    pub fn with_pricing(config: CalculatedMarketConfig, pricing: Box<dyn PivotPricing>) -> Self {
        Self {
            config,
            pricing,
            ladder: None,
            last_success: None,
            stale: false,
        }
    }

    /// Recompute the ladder from a freshly fetched reference rate
    pub fn apply_rate(&mut self, reference_rate: Decimal, now: DateTime<Utc>) -> ObservabilityEvent {
        let ladder = FairValueLadder::compute(reference_rate, &self.config, self.pricing.as_ref(), now);
        info!(
            reference_rate = %reference_rate,
            pivot = %ladder.pivot,
            levels = ladder.levels.len(),
            "Fair-value ladder refreshed"
        );

        let event = ObservabilityEvent::LadderRefreshed {
            timestamp: now,
            reference_rate: reference_rate.to_string(),
            pivot: ladder.pivot.to_string(),
            levels: ladder.levels.len(),
        };
        self.ladder = Some(Arc::new(ladder));
        self.last_success = Some(now);
        self.stale = false;
        event
    }

    /// Keep serving the previous ladder after a failed fetch
    pub fn mark_failed(&mut self, error: &FetchError, now: DateTime<Utc>) -> ObservabilityEvent {
        self.stale = true;
        let usable = self.is_usable(now);
        warn!(error = %error, usable, "Reference rate fetch failed, ladder is stale");
        ObservabilityEvent::LadderStale {
            timestamp: now,
            error: error.to_string(),
            usable,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// A ladder exists and the last success is within the grace period
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        if !self.config.enabled {
            return false;
        }
        match (&self.ladder, self.last_success) {
            (Some(_), Some(last)) => {
                !self.stale || now - last <= Duration::seconds(self.config.stale_grace_secs as i64)
            }
            _ => false,
        }
    }

    pub fn ladder(&self) -> Option<&Arc<FairValueLadder>> {
        self.ladder.as_ref()
    }

    pub fn in_fixing_window(&self, now: DateTime<Utc>) -> bool {
        let time = now.time();
        self.config.fixing_windows.iter().any(|w| w.contains(time))
    }

    /// Snapshot for detectors, `None` when calculated-market patterns are suppressed
    pub fn snapshot(&self, now: DateTime<Utc>) -> Option<CalculatedSnapshot> {
        if !self.is_usable(now) {
            return None;
        }
        let ladder = Arc::clone(self.ladder.as_ref()?);
        Some(CalculatedSnapshot {
            ladder,
            stale: self.stale,
            tolerance: self.config.tolerance,
            in_fixing_window: self.in_fixing_window(now),
            stop_buffer: self.config.stop_buffer,
            fallback_offset: self.config.fallback_offset,
            fixing_confidence_boost: self.config.fixing_confidence_boost,
        })
    }

    pub fn config(&self) -> &CalculatedMarketConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LevelConfig;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn create_test_config() -> CalculatedMarketConfig {
        CalculatedMarketConfig {
            differential: dec!(0),
            volatility_unit: dec!(12.5),
            ..CalculatedMarketConfig::default()
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_forward_points_pivot() {
        let pivot = ForwardPointsPricing.pivot(dec!(5.4321), dec!(25));
        assert_eq!(pivot, dec!(5457.1));
    }

    #[test]
    fn test_ladder_prices_are_exact() {
        let ladder = FairValueLadder::compute(dec!(5.0), &create_test_config(), &ForwardPointsPricing, ts(0));
        assert_eq!(ladder.pivot, dec!(5000));

        let level = ladder.level("strong_overbought").unwrap();
        assert_eq!(level.price, dec!(5015.625));
        assert_eq!(level.kind, LevelKind::Resistance);
        assert_eq!(level.strength, 2);

        let extreme = ladder.level("extreme_oversold").unwrap();
        assert_eq!(extreme.kind, LevelKind::Support);
        assert_eq!(extreme.strength, 3);

        let pivot = ladder.level("pivot").unwrap();
        assert_eq!(pivot.kind, LevelKind::Pivot);
        assert_eq!(pivot.strength, 0);
    }

    #[test]
    fn test_proximity_tolerance() {
        let config = CalculatedMarketConfig {
            levels: vec![LevelConfig::new("strong_overbought", dec!(1.25))],
            ..create_test_config()
        };
        let ladder = FairValueLadder::compute(dec!(5.0), &config, &ForwardPointsPricing, ts(0));

        let near = ladder.nearest(5016.0, 3.0).unwrap();
        assert_eq!(near.level.name, "strong_overbought");
        assert!(near.within_tolerance);
        assert!((near.distance - 0.375).abs() < 1e-9);

        let far = ladder.nearest(5025.0, 3.0).unwrap();
        assert!(!far.within_tolerance);
    }

    #[test]
    fn test_stops_and_targets() {
        let ladder = FairValueLadder::compute(dec!(5.0), &create_test_config(), &ForwardPointsPricing, ts(0));

        // mild_oversold 4994.375, mild_overbought 5005.625
        let long = ladder.stops_and_targets(SignalDirection::Long, 5000.0, 5.0, 20.0);
        assert!((long.stop - 4989.375).abs() < 1e-9);
        assert!((long.target - 5005.625).abs() < 1e-9);

        let short = ladder.stops_and_targets(SignalDirection::Short, 5000.0, 5.0, 20.0);
        assert!((short.stop - 5010.625).abs() < 1e-9);
        assert!((short.target - 4994.375).abs() < 1e-9);

        // above the whole ladder
        let long = ladder.stops_and_targets(SignalDirection::Long, 5100.0, 5.0, 20.0);
        assert_eq!(long.target, 5120.0);
    }

    #[test]
    fn test_stale_grace_from_last_success() {
        let config = CalculatedMarketConfig {
            stale_grace_secs: 60,
            ..create_test_config()
        };
        let mut module = CalculatedMarketModule::new(config);
        assert!(module.snapshot(ts(0)).is_none());

        module.apply_rate(dec!(5.0), ts(0));
        assert!(module.snapshot(ts(10)).is_some());

        let event = module.mark_failed(&FetchError::Unavailable, ts(30));
        assert!(matches!(event, ObservabilityEvent::LadderStale { usable: true, .. }));
        let snapshot = module.snapshot(ts(50)).unwrap();
        assert!(snapshot.stale);

        // grace counts from the last success, not from the failure
        assert!(module.snapshot(ts(61)).is_none());

        module.apply_rate(dec!(5.1), ts(70));
        assert!(!module.is_stale());
        assert!(module.snapshot(ts(500)).is_some());
    }

    #[test]
    fn test_fixing_window() {
        let module = CalculatedMarketModule::new(create_test_config());
        let inside = Utc.with_ymd_and_hms(2024, 3, 4, 10, 5, 0).unwrap();
        let outside = Utc.with_ymd_and_hms(2024, 3, 4, 10, 30, 0).unwrap();
        assert!(module.in_fixing_window(inside));
        assert!(!module.in_fixing_window(outside));
    }
}
