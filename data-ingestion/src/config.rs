//! Ingestion boundary configuration

use common::ConfigError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestionConfig {
    #[serde(default)]
    pub feed: FeedConfig,

    #[serde(default)]
    pub reference_rate: ReferenceRateConfig,
}

impl IngestionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.feed.channel_capacity == 0 {
            return Err(ConfigError::invalid("ingestion.feed.channel_capacity", "must be positive"));
        }
        let rate = &self.reference_rate;
        if rate.enabled && rate.url.trim().is_empty() {
            return Err(ConfigError::invalid("ingestion.reference_rate.url", "must not be empty"));
        }
        if rate.timeout_secs == 0 {
            return Err(ConfigError::invalid("ingestion.reference_rate.timeout_secs", "must be positive"));
        }
        if rate.refresh_secs == 0 {
            return Err(ConfigError::invalid("ingestion.reference_rate.refresh_secs", "must be positive"));
        }
        if let Some(fallback) = rate.fallback_rate {
            if fallback <= Decimal::ZERO {
                return Err(ConfigError::invalid("ingestion.reference_rate.fallback_rate", "must be positive"));
            }
        }
        Ok(())
    }
}

/// JSON-lines market event feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// File to replay; standard input when unset
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            path: None,
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_channel_capacity() -> usize {
    4096
}

/// Reference exchange rate source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceRateConfig {
    /// Query the central bank API; when disabled only the fallback rate is used
    #[serde(default = "default_rate_enabled")]
    pub enabled: bool,

    #[serde(default = "default_rate_url")]
    pub url: String,

    #[serde(default = "default_historical_url")]
    pub historical_url: String,

    #[serde(default = "default_rate_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,

    /// Delivered when no rate has been fetched yet
    #[serde(default = "default_fallback_rate")]
    pub fallback_rate: Option<Decimal>,

    /// Fixing date to look up when replaying a past session (dd/mm/yyyy)
    #[serde(default)]
    pub target_date: Option<String>,
}

impl Default for ReferenceRateConfig {
    fn default() -> Self {
        Self {
            enabled: default_rate_enabled(),
            url: default_rate_url(),
            historical_url: default_historical_url(),
            timeout_secs: default_rate_timeout(),
            refresh_secs: default_refresh_secs(),
            fallback_rate: default_fallback_rate(),
            target_date: None,
        }
    }
}

fn default_rate_enabled() -> bool {
    true
}

fn default_rate_url() -> String {
    "https://api.bcb.gov.br/dados/serie/bcdata.sgs.1/dados/ultimos/5?formato=json".to_string()
}

fn default_historical_url() -> String {
    "https://api.bcb.gov.br/dados/serie/bcdata.sgs.1/dados?formato=json&dataInicial={start}&dataFinal={end}"
        .to_string()
}

fn default_rate_timeout() -> u64 {
    10
}

fn default_refresh_secs() -> u64 {
    300
}

fn default_fallback_rate() -> Option<Decimal> {
    Decimal::from_str("5.45").ok()
}
