use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ReferenceRateConfig;
use common::FetchError;

/// Business days searched backwards for a historical fixing
const HISTORICAL_LOOKBACK_DAYS: i64 = 10;

/// Source of the reference exchange rate
#[async_trait]
pub trait ReferenceRateSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self) -> Result<Decimal, FetchError>;
}

/// One observation of an SGS series
#[derive(Debug, Deserialize)]
struct SgsObservation {
    data: String,
    valor: String,
}

/// PTAX selling rate from the Banco Central do Brasil SGS API (series 1)
pub struct BcbPtaxSource {
    client: Client,
    url: String,
    historical_url: String,
    target_date: Option<NaiveDate>,
}

impl BcbPtaxSource {
    pub fn new(config: &ReferenceRateConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;

        let target_date = config
            .target_date
            .as_deref()
            .map(|d| NaiveDate::parse_from_str(d, "%d/%m/%Y"))
            .transpose()?;

        Ok(Self {
            client,
            url: config.url.clone(),
            historical_url: config.historical_url.clone(),
            target_date,
        })
    }

    /// Most recent fixing: the last observation of the response
    pub fn parse_latest(body: &str) -> Result<Decimal, FetchError> {
        let observations: Vec<SgsObservation> =
            serde_json::from_str(body).map_err(|e| FetchError::Malformed(e.to_string()))?;
        let latest = observations.last().ok_or(FetchError::Unavailable)?;
        debug!(date = %latest.data, valor = %latest.valor, "PTAX observation");
        parse_rate(&latest.valor)
    }

    async fn get(&self, url: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FetchError::Transport(format!("BCB API error: {}", response.status())));
        }

        response.text().await.map_err(|e| FetchError::Transport(e.to_string()))
    }

    async fn fetch_latest(&self) -> Result<Decimal, FetchError> {
        let body = self.get(&self.url).await?;
        let rate = Self::parse_latest(&body)?;
        info!(rate = %rate, "💱 PTAX fetched");
        Ok(rate)
    }

    /// Fixing in force on `target`: the nearest earlier day that has one
    async fn fetch_historical(&self, target: NaiveDate) -> Result<Decimal, FetchError> {
        for days_back in 1..=HISTORICAL_LOOKBACK_DAYS {
            let day = target - Duration::days(days_back);
            let formatted = day.format("%d/%m/%Y").to_string();
            let url = self
                .historical_url
                .replace("{start}", &formatted)
                .replace("{end}", &formatted);

            match self.get(&url).await.and_then(|body| Self::parse_latest(&body)) {
                Ok(rate) => {
                    info!(rate = %rate, date = %formatted, "💱 Historical PTAX fetched");
                    return Ok(rate);
                }
                Err(FetchError::Transport(e)) => return Err(FetchError::Transport(e)),
                Err(e) => debug!(date = %formatted, error = %e, "No PTAX for date"),
            }
        }
        Err(FetchError::Unavailable)
    }
}

#[async_trait]
impl ReferenceRateSource for BcbPtaxSource {
    fn name(&self) -> &str {
        "bcb_ptax"
    }

    async fn fetch(&self) -> Result<Decimal, FetchError> {
        match self.target_date {
            Some(target) => self.fetch_historical(target).await,
            None => self.fetch_latest().await,
        }
    }
}

fn parse_rate(raw: &str) -> Result<Decimal, FetchError> {
    // SGS uses a dot separator, some mirrors a comma
    let rate = Decimal::from_str(&raw.trim().replace(',', "."))
        .map_err(|e| FetchError::Malformed(format!("valor '{}': {}", raw, e)))?;
    if rate <= Decimal::ZERO {
        return Err(FetchError::Malformed(format!("non-positive rate {}", rate)));
    }
    Ok(rate)
}

/// Fixed rate, for offline replay
pub struct StaticRateSource {
    rate: Option<Decimal>,
}

impl StaticRateSource {
    pub fn new(rate: Option<Decimal>) -> Self {
        Self { rate }
    }
}

#[async_trait]
impl ReferenceRateSource for StaticRateSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch(&self) -> Result<Decimal, FetchError> {
        self.rate.ok_or(FetchError::Unavailable)
    }
}

/// Result of one scheduled fetch
#[derive(Debug, Clone, PartialEq)]
pub enum RateUpdate {
    Fetched(Decimal),
    /// The configured rate, sent after a failure when nothing was ever fetched
    Fallback(Decimal),
    Failed(FetchError),
}

/// Fetch on every tick of `every` and send the outcome; ends when the receiver is dropped
pub async fn run_rate_fetcher(
    source: Arc<dyn ReferenceRateSource>,
    every: std::time::Duration,
    fallback: Option<Decimal>,
    tx: mpsc::Sender<RateUpdate>,
) {
    let mut ticker = tokio::time::interval(every);
    let mut delivered = false;

    info!(source = source.name(), every_secs = every.as_secs(), "Reference rate fetcher started");

    loop {
        ticker.tick().await;

        let mut updates = Vec::with_capacity(2);
        match source.fetch().await {
            Ok(rate) => {
                delivered = true;
                updates.push(RateUpdate::Fetched(rate));
            }
            Err(e) => {
                warn!(source = source.name(), error = %e, "Reference rate fetch failed");
                updates.push(RateUpdate::Failed(e));
                if let (false, Some(rate)) = (delivered, fallback) {
                    warn!(rate = %rate, "⚠️ Using fallback reference rate");
                    delivered = true;
                    updates.push(RateUpdate::Fallback(rate));
                }
            }
        }

        for update in updates {
            if tx.send(update).await.is_err() {
                debug!("Reference rate receiver dropped, stopping fetcher");
                return;
            }
        }
    }
}
