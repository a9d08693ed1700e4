//! Risk gate configuration

use chrono::NaiveTime;
use common::ConfigError;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Overall risk gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Emission rate and concurrency limits
    #[serde(default)]
    pub limits: RiskLimits,

    /// Circuit breaker configuration
    #[serde(default)]
    pub circuit_breakers: CircuitBreakerConfig,

    /// Quality scoring weights and threshold
    #[serde(default)]
    pub quality: QualityConfig,

    /// UTC time of day at which daily counters reset
    #[serde(default = "default_daily_reset")]
    pub daily_reset_utc: NaiveTime,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            limits: RiskLimits::default(),
            circuit_breakers: CircuitBreakerConfig::default(),
            quality: QualityConfig::default(),
            daily_reset_utc: default_daily_reset(),
        }
    }
}

fn default_daily_reset() -> NaiveTime {
    // midnight in Sao Paulo
    NaiveTime::from_hms_opt(3, 0, 0).unwrap_or(NaiveTime::MIN)
}

impl RiskConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = &self.limits;
        if limits.max_signals_per_minute == 0 {
            return Err(ConfigError::invalid("risk.limits.max_signals_per_minute", "must be positive"));
        }
        if limits.max_signals_per_hour < limits.max_signals_per_minute {
            return Err(ConfigError::invalid(
                "risk.limits.max_signals_per_hour",
                "must not be below the per-minute limit",
            ));
        }
        if limits.max_concurrent_signals == 0 {
            return Err(ConfigError::invalid("risk.limits.max_concurrent_signals", "must be positive"));
        }
        if limits.signal_validity_secs == 0 {
            return Err(ConfigError::invalid("risk.limits.signal_validity_secs", "must be positive"));
        }

        let breakers = &self.circuit_breakers;
        if breakers.consecutive_losses_limit == 0 {
            return Err(ConfigError::invalid(
                "risk.circuit_breakers.consecutive_losses_limit",
                "must be positive",
            ));
        }
        if !(breakers.max_drawdown_percent > 0.0) {
            return Err(ConfigError::invalid("risk.circuit_breakers.max_drawdown_percent", "must be positive"));
        }
        if breakers.daily_loss_limit <= Decimal::ZERO {
            return Err(ConfigError::invalid("risk.circuit_breakers.daily_loss_limit", "must be positive"));
        }

        if !(0.0..=1.0).contains(&self.quality.threshold) {
            return Err(ConfigError::invalid("risk.quality.threshold", "must be within [0, 1]"));
        }
        let weights = [
            self.quality.source_weight,
            self.quality.level_weight,
            self.quality.evidence_weight,
            self.quality.pattern_weight,
        ];
        if weights.iter().any(|w| *w < 0.0) || weights.iter().sum::<f64>() <= 0.0 {
            return Err(ConfigError::invalid("risk.quality", "weights must be non-negative with a positive sum"));
        }
        Ok(())
    }
}

/// Emission limits before regime adjustment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    #[serde(default = "default_max_per_minute")]
    pub max_signals_per_minute: usize,

    #[serde(default = "default_max_per_hour")]
    pub max_signals_per_hour: usize,

    #[serde(default = "default_max_confluence_per_hour")]
    pub max_confluence_per_hour: usize,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_signals: usize,

    /// How long an emitted signal counts as active
    #[serde(default = "default_validity_secs")]
    pub signal_validity_secs: u64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_signals_per_minute: 10,
            max_signals_per_hour: 100,
            max_confluence_per_hour: 20,
            max_concurrent_signals: 5,
            signal_validity_secs: 60,
        }
    }
}

fn default_max_per_minute() -> usize {
    10
}

fn default_max_per_hour() -> usize {
    100
}

fn default_max_confluence_per_hour() -> usize {
    20
}

fn default_max_concurrent() -> usize {
    5
}

fn default_validity_secs() -> u64 {
    60
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Whether outcome-driven breakers trip at all
    #[serde(default = "default_circuit_breakers_enabled")]
    pub enabled: bool,

    #[serde(default = "default_consecutive_losses")]
    pub consecutive_losses_limit: u32,

    /// Drawdown from the day's peak PnL, in percent
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown_percent: f64,

    /// Trip when daily PnL falls to minus this amount
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: Decimal,

    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            consecutive_losses_limit: 5,
            max_drawdown_percent: 2.0,
            daily_loss_limit: dec!(1000),
            cooldown_secs: 300,
        }
    }
}

fn default_circuit_breakers_enabled() -> bool {
    true
}

fn default_consecutive_losses() -> u32 {
    5
}

fn default_max_drawdown() -> f64 {
    2.0
}

fn default_daily_loss_limit() -> Decimal {
    dec!(1000)
}

fn default_cooldown_secs() -> u64 {
    300
}

/// Quality score weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    #[serde(default = "default_quality_threshold")]
    pub threshold: f64,

    #[serde(default = "default_source_weight")]
    pub source_weight: f64,

    #[serde(default = "default_level_weight")]
    pub level_weight: f64,

    #[serde(default = "default_evidence_weight")]
    pub evidence_weight: f64,

    #[serde(default = "default_pattern_weight")]
    pub pattern_weight: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            threshold: 0.35,
            source_weight: 1.5,
            level_weight: 0.8,
            evidence_weight: 1.5,
            pattern_weight: 1.2,
        }
    }
}

fn default_quality_threshold() -> f64 {
    0.35
}

fn default_source_weight() -> f64 {
    1.5
}

fn default_level_weight() -> f64 {
    0.8
}

fn default_evidence_weight() -> f64 {
    1.5
}

fn default_pattern_weight() -> f64 {
    1.2
}
