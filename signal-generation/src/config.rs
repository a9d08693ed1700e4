//! Signal generation configuration
//!
//! One immutable value built at startup and passed to every stage.

use chrono::NaiveTime;
use common::{ConfigError, FilterAction, PatternType};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Overall signal generation configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalConfig {
    #[serde(default)]
    pub market_state: MarketStateConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub detectors: DetectorConfig,

    #[serde(default)]
    pub cooldowns: CooldownConfig,

    #[serde(default)]
    pub manipulation: ManipulationConfig,

    #[serde(default)]
    pub confirmation: ConfirmationConfig,

    #[serde(default)]
    pub calculated: CalculatedMarketConfig,
}

impl SignalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let state = &self.market_state;
        if state.trade_capacity == 0 || state.book_capacity == 0 || state.cvd_capacity == 0 {
            return Err(ConfigError::invalid("market_state", "capacities must be positive"));
        }
        if state.cvd_roc_period_secs == 0 {
            return Err(ConfigError::invalid("market_state.cvd_roc_period_secs", "must be positive"));
        }

        let unit_checks = [
            ("detectors.absorption.concentration", self.detectors.absorption.concentration),
            ("detectors.pressure.min_share", self.detectors.pressure.min_share),
            ("detectors.institutional.min_score", self.detectors.institutional.min_score),
            ("detectors.institutional.min_range_share", self.detectors.institutional.min_range_share),
            ("detectors.trap.min_retrace", self.detectors.trap.min_retrace),
            ("manipulation.layering.penalty", self.manipulation.layering.penalty),
            ("manipulation.spoofing.penalty", self.manipulation.spoofing.penalty),
        ];
        for (field, value) in unit_checks {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::invalid(field, format!("{} is outside [0, 1]", value)));
            }
        }

        if self.confirmation.max_pending == 0 {
            return Err(ConfigError::invalid("confirmation.max_pending", "must be positive"));
        }
        if self.confirmation.check_interval_ms == 0 {
            return Err(ConfigError::invalid("confirmation.check_interval_ms", "must be positive"));
        }
        if self.detectors.multiframe.windows_secs.len() != 4 {
            return Err(ConfigError::invalid(
                "detectors.multiframe.windows_secs",
                "expected micro, short, medium and long windows",
            ));
        }
        if self.calculated.enabled && self.calculated.levels.is_empty() {
            return Err(ConfigError::invalid("calculated.levels", "ladder has no levels"));
        }
        if self.calculated.tolerance < 0.0 {
            return Err(ConfigError::invalid("calculated.tolerance", "must not be negative"));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

/// Rolling buffer sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketStateConfig {
    #[serde(default = "default_trade_capacity")]
    pub trade_capacity: usize,

    #[serde(default = "default_book_capacity")]
    pub book_capacity: usize,

    #[serde(default = "default_cvd_capacity")]
    pub cvd_capacity: usize,

    /// Trailing period for CVD rate-of-change
    #[serde(default = "default_cvd_roc_period")]
    pub cvd_roc_period_secs: u64,
}

impl Default for MarketStateConfig {
    fn default() -> Self {
        Self {
            trade_capacity: 5000,
            book_capacity: 200,
            cvd_capacity: 5000,
            cvd_roc_period_secs: 15,
        }
    }
}

fn default_trade_capacity() -> usize {
    5000
}

fn default_book_capacity() -> usize {
    200
}

fn default_cvd_capacity() -> usize {
    5000
}

fn default_cvd_roc_period() -> u64 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Evaluate detectors on blocking workers instead of inline
    #[serde(default)]
    pub parallel_detectors: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            parallel_detectors: false,
        }
    }
}

/// Per-detector parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub absorption: AbsorptionConfig,
    pub iceberg: IcebergConfig,
    pub divergence: DivergenceConfig,
    pub momentum: MomentumConfig,
    pub pressure: PressureConfig,
    pub volume_spike: VolumeSpikeConfig,
    pub pace: PaceConfig,
    pub book: BookDynamicsConfig,
    pub institutional: InstitutionalConfig,
    pub hidden_liquidity: HiddenLiquidityConfig,
    pub multiframe: MultiframeConfig,
    pub trap: TrapConfig,
    pub calculated: CalculatedDetectorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbsorptionConfig {
    pub enabled: bool,
    pub window_secs: u64,
    pub min_level_volume: i64,
    /// Share of window volume traded at the level
    pub concentration: f64,
    pub max_range: f64,
}

impl Default for AbsorptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 60,
            min_level_volume: 282,
            concentration: 0.40,
            max_range: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IcebergConfig {
    pub enabled: bool,
    pub window_secs: u64,
    pub min_volume: i64,
    pub min_repetitions: usize,
}

impl Default for IcebergConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 60,
            min_volume: 59,
            min_repetitions: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DivergenceConfig {
    pub enabled: bool,
    pub lookback_trades: usize,
    /// Price move in points
    pub price_threshold: f64,
    pub roc_threshold: f64,
}

impl Default for DivergenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lookback_trades: 50,
            price_threshold: 1.0,
            roc_threshold: 50.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MomentumConfig {
    pub enabled: bool,
    pub roc_threshold: f64,
}

impl Default for MomentumConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            roc_threshold: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureConfig {
    pub enabled: bool,
    pub lookback_trades: usize,
    pub min_share: f64,
    pub min_volume: i64,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lookback_trades: 20,
            min_share: 0.75,
            min_volume: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeSpikeConfig {
    pub enabled: bool,
    pub recent_trades: usize,
    pub multiplier: f64,
    pub min_history: usize,
}

impl Default for VolumeSpikeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            recent_trades: 10,
            multiplier: 3.0,
            min_history: 40,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaceConfig {
    pub enabled: bool,
    pub window_secs: u64,
    pub std_threshold: f64,
    pub min_baseline_windows: usize,
    pub max_baseline_windows: usize,
}

impl Default for PaceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 10,
            std_threshold: 2.0,
            min_baseline_windows: 5,
            max_baseline_windows: 30,
        }
    }
}

/// Pulling, stacking, flash orders and imbalance shifts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BookDynamicsConfig {
    pub pulling_enabled: bool,
    pub stacking_enabled: bool,
    pub flash_enabled: bool,
    pub imbalance_enabled: bool,
    pub depth: usize,
    pub pulling_min_volume: i64,
    pub pulling_drop: f64,
    pub stacking_min_volume: i64,
    pub stacking_ratio: f64,
    pub flash_min_volume: i64,
    pub flash_max_lifetime_secs: f64,
    pub imbalance_shift: f64,
}

impl Default for BookDynamicsConfig {
    fn default() -> Self {
        Self {
            pulling_enabled: true,
            stacking_enabled: true,
            flash_enabled: true,
            imbalance_enabled: true,
            depth: 10,
            pulling_min_volume: 100,
            pulling_drop: 0.5,
            stacking_min_volume: 200,
            stacking_ratio: 2.0,
            flash_min_volume: 500,
            flash_max_lifetime_secs: 2.0,
            imbalance_shift: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstitutionalConfig {
    pub enabled: bool,
    pub window_secs: u64,
    pub min_trades: usize,
    pub sizes: Vec<i64>,
    pub size_tolerance: f64,
    pub min_repeats: usize,
    pub range_min: i64,
    pub range_max: i64,
    pub min_range_share: f64,
    pub min_score: f64,
}

impl Default for InstitutionalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 300,
            min_trades: 50,
            sizes: vec![10, 20, 25, 50, 100, 200, 250, 500, 1000],
            size_tolerance: 0.10,
            min_repeats: 3,
            range_min: 50,
            range_max: 1000,
            min_range_share: 0.3,
            min_score: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HiddenLiquidityConfig {
    pub enabled: bool,
    pub recent_trades: usize,
    pub excess_ratio: f64,
    pub level_tolerance: f64,
    pub min_reloads: usize,
    pub reload_gap_secs: f64,
    pub min_hidden_volume: i64,
}

impl Default for HiddenLiquidityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            recent_trades: 20,
            excess_ratio: 1.5,
            level_tolerance: 0.5,
            min_reloads: 2,
            reload_gap_secs: 2.0,
            min_hidden_volume: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiframeConfig {
    pub divergence_enabled: bool,
    pub confluence_enabled: bool,
    /// Micro, short, medium and long windows
    pub windows_secs: Vec<u64>,
    pub divergence_threshold: f64,
    pub sign_threshold: f64,
    pub min_short_trades: usize,
    pub min_long_trades: usize,
    pub confluence_min_windows: usize,
    pub confluence_min_trades: usize,
    pub confluence_sign_threshold: f64,
    pub confluence_threshold: f64,
}

impl Default for MultiframeConfig {
    fn default() -> Self {
        Self {
            divergence_enabled: true,
            confluence_enabled: true,
            windows_secs: vec![60, 300, 900, 1800],
            divergence_threshold: 0.3,
            sign_threshold: 0.2,
            min_short_trades: 10,
            min_long_trades: 20,
            confluence_min_windows: 3,
            confluence_min_trades: 5,
            confluence_sign_threshold: 0.1,
            confluence_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrapConfig {
    pub enabled: bool,
    pub min_trades: usize,
    /// Breakout beyond the prior range, as a fraction of the broken level
    pub breakout_pct: f64,
    pub min_retrace: f64,
    pub stop_hunt_pct: f64,
}

impl Default for TrapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_trades: 100,
            breakout_pct: 0.002,
            min_retrace: 0.7,
            stop_hunt_pct: 0.003,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalculatedDetectorConfig {
    pub enabled: bool,
    /// Trades used to infer flow direction at the pivot
    pub flow_lookback_trades: usize,
}

impl Default for CalculatedDetectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flow_lookback_trades: 20,
        }
    }
}

/// Cooldown per pattern in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownConfig {
    #[serde(default = "default_cooldown_secs")]
    pub default_secs: u64,

    #[serde(default = "default_pattern_cooldowns")]
    pub patterns: HashMap<PatternType, u64>,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            default_secs: default_cooldown_secs(),
            patterns: default_pattern_cooldowns(),
        }
    }
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_pattern_cooldowns() -> HashMap<PatternType, u64> {
    HashMap::from([
        (PatternType::Pressure, 15),
        (PatternType::MomentumExtreme, 20),
        (PatternType::Absorption, 30),
        (PatternType::Divergence, 25),
        (PatternType::Iceberg, 30),
        (PatternType::VolumeSpike, 15),
        (PatternType::PaceAnomaly, 20),
        (PatternType::InstitutionalFootprint, 60),
        (PatternType::HiddenLiquidity, 45),
        (PatternType::MultiframeDivergence, 40),
        (PatternType::MultiframeConfluence, 35),
        (PatternType::Trap, 30),
        (PatternType::BookPulling, 10),
        (PatternType::BookStacking, 10),
        (PatternType::FlashOrder, 5),
        (PatternType::ImbalanceShift, 15),
    ])
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManipulationConfig {
    pub layering: LayeringConfig,
    pub spoofing: SpoofingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayeringConfig {
    pub enabled: bool,
    pub min_levels: usize,
    pub min_level_volume: i64,
    /// Maximum coefficient of variation across the run
    pub max_uniformity: f64,
    pub scan_depth: usize,
    pub action: FilterAction,
    pub penalty: f64,
}

impl Default for LayeringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_levels: 4,
            min_level_volume: 50,
            max_uniformity: 0.10,
            scan_depth: 10,
            action: FilterAction::Annotate,
            penalty: 0.4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoofingConfig {
    pub enabled: bool,
    pub depth: usize,
    pub min_ratio: f64,
    pub action: FilterAction,
    pub penalty: f64,
}

impl Default for SpoofingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            depth: 5,
            min_ratio: 5.0,
            action: FilterAction::Annotate,
            penalty: 0.3,
        }
    }
}

/// Pending confirmation limits and per-pattern rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationConfig {
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    #[serde(default)]
    pub absorption: AbsorptionRule,

    #[serde(default)]
    pub divergence: DivergenceRule,

    #[serde(default)]
    pub momentum: MomentumRule,

    #[serde(default)]
    pub institutional: InstitutionalRule,

    #[serde(default)]
    pub hidden_liquidity: HiddenLiquidityRule,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            max_pending: 50,
            check_interval_ms: 1000,
            absorption: AbsorptionRule::default(),
            divergence: DivergenceRule::default(),
            momentum: MomentumRule::default(),
            institutional: InstitutionalRule::default(),
            hidden_liquidity: HiddenLiquidityRule::default(),
        }
    }
}

fn default_max_pending() -> usize {
    50
}

fn default_check_interval_ms() -> u64 {
    1000
}

impl ConfirmationConfig {
    /// Timeout for a confirmable pattern, `None` when the pattern goes straight to risk
    pub fn timeout_secs(&self, pattern: PatternType) -> Option<u64> {
        match pattern {
            PatternType::Absorption if self.absorption.enabled => Some(self.absorption.timeout_secs),
            PatternType::Divergence if self.divergence.enabled => Some(self.divergence.timeout_secs),
            PatternType::MomentumExtreme if self.momentum.enabled => Some(self.momentum.timeout_secs),
            PatternType::InstitutionalFootprint if self.institutional.enabled => {
                Some(self.institutional.timeout_secs)
            }
            PatternType::HiddenLiquidity if self.hidden_liquidity.enabled => {
                Some(self.hidden_liquidity.timeout_secs)
            }
            _ => None,
        }
    }

    pub fn is_confirmable(&self, pattern: PatternType) -> bool {
        self.timeout_secs(pattern).is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbsorptionRule {
    pub enabled: bool,
    pub timeout_secs: u64,
    pub min_tests: usize,
    pub level_tolerance: f64,
    /// Test volume relative to the detection's average trade volume
    pub volume_factor: f64,
    pub break_distance: f64,
}

impl Default for AbsorptionRule {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 30,
            min_tests: 2,
            level_tolerance: 0.5,
            volume_factor: 0.7,
            break_distance: 2.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DivergenceRule {
    pub enabled: bool,
    pub timeout_secs: u64,
    pub hold_ticks: usize,
    pub long_hold_ratio: f64,
    pub short_hold_ratio: f64,
    pub invalidation_pct: f64,
}

impl Default for DivergenceRule {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 20,
            hold_ticks: 3,
            long_hold_ratio: 0.999,
            short_hold_ratio: 1.001,
            invalidation_pct: 0.002,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MomentumRule {
    pub enabled: bool,
    pub timeout_secs: u64,
    pub confirm_volume: i64,
    pub invalidate_volume: i64,
}

impl Default for MomentumRule {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 15,
            confirm_volume: 50,
            invalidate_volume: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstitutionalRule {
    pub enabled: bool,
    pub timeout_secs: u64,
    pub min_elapsed_secs: u64,
    pub min_share: f64,
    pub lookback_trades: usize,
}

impl Default for InstitutionalRule {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 60,
            min_elapsed_secs: 30,
            min_share: 0.3,
            lookback_trades: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HiddenLiquidityRule {
    pub enabled: bool,
    pub timeout_secs: u64,
    pub reload_ticks: usize,
}

impl Default for HiddenLiquidityRule {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: 45,
            reload_ticks: 2,
        }
    }
}

/// Named ladder multiplier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelConfig {
    pub name: String,
    pub multiplier: Decimal,
}

impl LevelConfig {
    pub fn new(name: &str, multiplier: Decimal) -> Self {
        Self {
            name: name.to_string(),
            multiplier,
        }
    }
}

/// Intraday reference fixing window (UTC)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixingWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl FixingWindow {
    pub fn contains(&self, time: NaiveTime) -> bool {
        time >= self.start && time <= self.end
    }
}

/// Fair-value ladder parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculatedMarketConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interest differential added to the forward pivot, in points
    #[serde(default = "default_differential")]
    pub differential: Decimal,

    #[serde(default = "default_volatility_unit")]
    pub volatility_unit: Decimal,

    #[serde(default = "default_levels")]
    pub levels: Vec<LevelConfig>,

    /// Proximity tolerance in points
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    /// How long a ladder stays usable after the last successful refresh
    #[serde(default = "default_stale_grace")]
    pub stale_grace_secs: u64,

    #[serde(default = "default_stop_buffer")]
    pub stop_buffer: f64,

    #[serde(default = "default_fallback_offset")]
    pub fallback_offset: f64,

    #[serde(default = "default_fixing_windows")]
    pub fixing_windows: Vec<FixingWindow>,

    /// Confidence added inside a fixing window
    #[serde(default = "default_fixing_boost")]
    pub fixing_confidence_boost: f64,
}

impl Default for CalculatedMarketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            differential: default_differential(),
            volatility_unit: default_volatility_unit(),
            levels: default_levels(),
            tolerance: default_tolerance(),
            stale_grace_secs: default_stale_grace(),
            stop_buffer: default_stop_buffer(),
            fallback_offset: default_fallback_offset(),
            fixing_windows: default_fixing_windows(),
            fixing_confidence_boost: default_fixing_boost(),
        }
    }
}

fn default_differential() -> Decimal {
    dec!(25)
}

fn default_volatility_unit() -> Decimal {
    dec!(12.5)
}

fn default_levels() -> Vec<LevelConfig> {
    vec![
        LevelConfig::new("extreme_overbought", dec!(1.60)),
        LevelConfig::new("strong_overbought", dec!(1.25)),
        LevelConfig::new("overbought", dec!(0.80)),
        LevelConfig::new("mild_overbought", dec!(0.45)),
        LevelConfig::new("pivot", dec!(0)),
        LevelConfig::new("mild_oversold", dec!(-0.45)),
        LevelConfig::new("oversold", dec!(-0.80)),
        LevelConfig::new("strong_oversold", dec!(-1.25)),
        LevelConfig::new("extreme_oversold", dec!(-1.60)),
    ]
}

fn default_tolerance() -> f64 {
    3.0
}

fn default_stale_grace() -> u64 {
    900
}

fn default_stop_buffer() -> f64 {
    5.0
}

fn default_fallback_offset() -> f64 {
    20.0
}

fn default_fixing_windows() -> Vec<FixingWindow> {
    [10, 11, 12, 13]
        .into_iter()
        .filter_map(|hour| {
            Some(FixingWindow {
                start: NaiveTime::from_hms_opt(hour, 0, 0)?,
                end: NaiveTime::from_hms_opt(hour, 10, 0)?,
            })
        })
        .collect()
}

fn default_fixing_boost() -> f64 {
    0.1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SignalConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.detectors.iceberg.min_volume, 59);
        assert_eq!(config.cooldowns.patterns[&PatternType::FlashOrder], 5);
        assert_eq!(config.calculated.levels.len(), 9);
        assert_eq!(config.calculated.fixing_windows.len(), 4);
    }

    #[test]
    fn test_config_serialization() {
        let config = SignalConfig::default();
        let serialized = toml::to_string(&config).unwrap();
        let deserialized: SignalConfig = toml::from_str(&serialized).unwrap();

        assert_eq!(deserialized.calculated.volatility_unit, dec!(12.5));
        assert_eq!(deserialized.cooldowns.patterns.len(), config.cooldowns.patterns.len());
        assert_eq!(deserialized.manipulation.layering.action, FilterAction::Annotate);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SignalConfig = toml::from_str(
            r#"
            [detectors.pressure]
            min_share = 0.8
            "#,
        )
        .unwrap();
        assert_eq!(config.detectors.pressure.min_share, 0.8);
        assert_eq!(config.detectors.pressure.min_volume, 100);
        assert_eq!(config.confirmation.max_pending, 50);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = SignalConfig::default();
        config.manipulation.layering.penalty = 1.5;
        assert!(config.validate().is_err());

        let mut config = SignalConfig::default();
        config.confirmation.check_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = SignalConfig::default();
        config.calculated.levels.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_confirmable_patterns() {
        let config = ConfirmationConfig::default();
        assert_eq!(config.timeout_secs(PatternType::Absorption), Some(30));
        assert!(!config.is_confirmable(PatternType::Pressure));
    }
}
