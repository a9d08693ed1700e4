//! Regime-driven adjustment of admission limits
//!
//! Regime labels arrive from an external classifier per instrument. The
//! adapter folds both labels into multiplicative factors and derives the
//! limits the gate enforces.

use crate::config::RiskConfig;
use common::Instrument;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const FACTOR_MIN: f64 = 0.3;
const FACTOR_MAX: f64 = 2.0;
const QUALITY_THRESHOLD_CAP: f64 = 0.9;
// absorbs float error before truncating scaled counts
const TRUNCATION_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    TrendingUp,
    TrendingDown,
    Ranging,
    Volatile,
    Quiet,
    Breakout,
    Reversal,
}

impl MarketRegime {
    pub fn as_str(self) -> &'static str {
        match self {
            MarketRegime::TrendingUp => "trending_up",
            MarketRegime::TrendingDown => "trending_down",
            MarketRegime::Ranging => "ranging",
            MarketRegime::Volatile => "volatile",
            MarketRegime::Quiet => "quiet",
            MarketRegime::Breakout => "breakout",
            MarketRegime::Reversal => "reversal",
        }
    }
}

impl Default for MarketRegime {
    fn default() -> Self {
        MarketRegime::Ranging
    }
}

impl fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketRegime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trending_up" => Ok(MarketRegime::TrendingUp),
            "trending_down" => Ok(MarketRegime::TrendingDown),
            "ranging" => Ok(MarketRegime::Ranging),
            "volatile" => Ok(MarketRegime::Volatile),
            "quiet" => Ok(MarketRegime::Quiet),
            "breakout" => Ok(MarketRegime::Breakout),
            "reversal" => Ok(MarketRegime::Reversal),
            other => Err(format!("unknown market regime '{}'", other)),
        }
    }
}

/// Multipliers applied to the configured limits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentFactors {
    pub signal_frequency: f64,
    pub quality_threshold: f64,
    pub concurrent_signals: f64,
    pub timeout: f64,
    pub breaker_sensitivity: f64,
}

impl Default for AdjustmentFactors {
    fn default() -> Self {
        Self {
            signal_frequency: 1.0,
            quality_threshold: 1.0,
            concurrent_signals: 1.0,
            timeout: 1.0,
            breaker_sensitivity: 1.0,
        }
    }
}

impl AdjustmentFactors {
    fn apply(&mut self, regime: MarketRegime) {
        match regime {
            MarketRegime::TrendingUp | MarketRegime::TrendingDown => {
                self.signal_frequency *= 1.2;
                self.quality_threshold *= 0.9;
                self.concurrent_signals *= 1.3;
            }
            MarketRegime::Volatile => {
                self.signal_frequency *= 0.7;
                self.quality_threshold *= 1.3;
                self.concurrent_signals *= 0.6;
                self.timeout *= 0.8;
                self.breaker_sensitivity *= 1.5;
            }
            MarketRegime::Quiet => {
                self.signal_frequency *= 0.5;
                self.quality_threshold *= 1.5;
                self.concurrent_signals *= 0.5;
            }
            MarketRegime::Breakout => {
                self.signal_frequency *= 1.5;
                self.quality_threshold *= 0.8;
                self.concurrent_signals *= 1.5;
                self.timeout *= 1.2;
            }
            MarketRegime::Reversal => {
                self.signal_frequency *= 0.8;
                self.quality_threshold *= 1.2;
                self.concurrent_signals *= 0.8;
                self.breaker_sensitivity *= 1.3;
            }
            MarketRegime::Ranging => {}
        }
    }

    fn clamp(mut self) -> Self {
        for factor in [
            &mut self.signal_frequency,
            &mut self.quality_threshold,
            &mut self.concurrent_signals,
            &mut self.timeout,
            &mut self.breaker_sensitivity,
        ] {
            *factor = factor.clamp(FACTOR_MIN, FACTOR_MAX);
        }
        self
    }
}

/// Limits in force after regime adjustment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveLimits {
    pub max_signals_per_minute: usize,
    pub max_signals_per_hour: usize,
    pub max_confluence_per_hour: usize,
    pub max_concurrent_signals: usize,
    pub signal_validity_secs: u64,
    pub quality_threshold: f64,
    pub consecutive_losses_limit: u32,
    pub max_drawdown_percent: f64,
}

impl EffectiveLimits {
    pub fn derive(config: &RiskConfig, factors: &AdjustmentFactors) -> Self {
        let limits = &config.limits;
        let breakers = &config.circuit_breakers;
        let scale = |base: usize, factor: f64| (base as f64 * factor + TRUNCATION_EPSILON).floor() as usize;

        Self {
            max_signals_per_minute: scale(limits.max_signals_per_minute, factors.signal_frequency),
            max_signals_per_hour: scale(limits.max_signals_per_hour, factors.signal_frequency),
            max_confluence_per_hour: scale(limits.max_confluence_per_hour, factors.signal_frequency),
            max_concurrent_signals: scale(limits.max_concurrent_signals, factors.concurrent_signals).max(1),
            signal_validity_secs: ((limits.signal_validity_secs as f64 * factors.timeout + TRUNCATION_EPSILON).floor()
                as u64)
                .max(1),
            quality_threshold: (config.quality.threshold * factors.quality_threshold).min(QUALITY_THRESHOLD_CAP),
            // a more sensitive breaker trips on fewer losses and a shallower drawdown
            consecutive_losses_limit: ((breakers.consecutive_losses_limit as f64 / factors.breaker_sensitivity
                + TRUNCATION_EPSILON)
                .floor() as u32)
                .max(1),
            max_drawdown_percent: breakers.max_drawdown_percent / factors.breaker_sensitivity,
        }
    }
}

/// Tracks the regime of each instrument and the limits they imply
#[derive(Debug, Clone)]
pub struct RegimeAdapter {
    regimes: BTreeMap<Instrument, MarketRegime>,
    factors: AdjustmentFactors,
    limits: EffectiveLimits,
}

impl RegimeAdapter {
    pub fn new(config: &RiskConfig) -> Self {
        let regimes = Instrument::ALL
            .iter()
            .map(|i| (*i, MarketRegime::default()))
            .collect();
        let factors = AdjustmentFactors::default();
        Self {
            limits: EffectiveLimits::derive(config, &factors),
            regimes,
            factors,
        }
    }

    /// Record a regime label; returns true when the label changed
    pub fn update(&mut self, instrument: Instrument, regime: MarketRegime, config: &RiskConfig) -> bool {
        let previous = self.regimes.insert(instrument, regime);
        if previous == Some(regime) {
            return false;
        }

        self.factors = Self::factors_for(&self.regimes);
        self.limits = EffectiveLimits::derive(config, &self.factors);

        tracing::info!(
            instrument = %instrument,
            old = ?previous,
            new = %regime,
            per_minute = self.limits.max_signals_per_minute,
            concurrent = self.limits.max_concurrent_signals,
            quality = self.limits.quality_threshold,
            "Regime changed - limits adjusted"
        );
        true
    }

    fn factors_for(regimes: &BTreeMap<Instrument, MarketRegime>) -> AdjustmentFactors {
        let mut factors = AdjustmentFactors::default();
        for regime in regimes.values() {
            factors.apply(*regime);
        }

        if regimes.get(&Instrument::Wdo) != regimes.get(&Instrument::Dol) {
            factors.quality_threshold *= 1.1;
            factors.concurrent_signals *= 0.9;
        }

        factors.clamp()
    }

    pub fn regime(&self, instrument: Instrument) -> MarketRegime {
        self.regimes.get(&instrument).copied().unwrap_or_default()
    }

    pub fn factors(&self) -> &AdjustmentFactors {
        &self.factors
    }

    pub fn limits(&self) -> &EffectiveLimits {
        &self.limits
    }
}
