//! Engine configuration
//!
//! One TOML file with a section per stage, overridable through `TAPE__*`
//! environment variables (`TAPE__RISK__LIMITS__MAX_SIGNALS_PER_MINUTE=5`).

use anyhow::{Context, Result};
use common::ConfigError;
use config::{Config, Environment, File};
use data_ingestion::IngestionConfig;
use risk_management::RiskConfig;
use serde::{Deserialize, Serialize};
use signal_generation::SignalConfig;
use std::path::Path;
use std::str::FromStr;
use tracing::Level;

pub const ENV_PREFIX: &str = "TAPE";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub signals: SignalConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub ingestion: IngestionConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl EngineConfig {
    /// Load from an optional file plus environment overrides, then validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.signals.validate()?;
        self.risk.validate()?;
        self.ingestion.validate()?;
        self.runtime.validate()
    }
}

/// Task wiring and process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Period of the stats log line
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    /// Observability broadcast buffer
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Accepted signals are written here as JSON lines; standard output when unset
    #[serde(default)]
    pub output_path: Option<String>,

    /// JSON-lines file of outcome, regime and breaker commands
    #[serde(default)]
    pub control_path: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            stats_interval_secs: default_stats_interval(),
            event_capacity: default_event_capacity(),
            output_path: None,
            control_path: None,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if Level::from_str(&self.log_level).is_err() {
            return Err(ConfigError::invalid(
                "runtime.log_level",
                format!("unknown level '{}'", self.log_level),
            ));
        }
        if self.stats_interval_secs == 0 {
            return Err(ConfigError::invalid("runtime.stats_interval_secs", "must be positive"));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::invalid("runtime.event_capacity", "must be positive"));
        }
        Ok(())
    }

    pub fn level(&self) -> Level {
        Level::from_str(&self.log_level).unwrap_or(Level::INFO)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_interval() -> u64 {
    60
}

fn default_event_capacity() -> usize {
    1024
}

/// Save configuration to TOML file
pub fn save_config(config: &EngineConfig, path: &str) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Create a configuration file holding every default
pub fn create_config_template(path: &str) -> Result<()> {
    let body = toml::to_string_pretty(&EngineConfig::default())?;
    let template = format!(
        "# Tape Signal Engine Configuration\n\
         # Every value below is the default; delete what you do not change.\n\
         # Environment overrides: {}__<SECTION>__<KEY>, e.g. {}__RUNTIME__LOG_LEVEL=debug\n\n{}",
        ENV_PREFIX, ENV_PREFIX, body
    );
    std::fs::write(path, template)?;
    Ok(())
}
