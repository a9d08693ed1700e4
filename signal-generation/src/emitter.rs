// Signal emitter boundary
// Accepted signals leave the engine through a SignalSink

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use common::{Instrument, PatternSignal, PatternType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Destination for accepted signals
#[async_trait::async_trait]
pub trait SignalSink: Send + Sync {
    /// Deliver one accepted signal
    async fn emit(&self, signal: &PatternSignal) -> Result<()>;

    /// Sink statistics
    async fn stats(&self) -> Result<SinkStats>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkStats {
    pub total_signals: usize,
    pub signals_by_pattern: BTreeMap<String, usize>,
    pub oldest_signal: Option<DateTime<Utc>>,
    pub newest_signal: Option<DateTime<Utc>>,
}

impl SinkStats {
    pub fn record(&mut self, signal: &PatternSignal) {
        self.total_signals += 1;
        *self
            .signals_by_pattern
            .entry(signal.pattern.to_string())
            .or_insert(0) += 1;
        if self.oldest_signal.map_or(true, |t| signal.timestamp < t) {
            self.oldest_signal = Some(signal.timestamp);
        }
        if self.newest_signal.map_or(true, |t| signal.timestamp > t) {
            self.newest_signal = Some(signal.timestamp);
        }
    }
}

/// Forwards signals into an mpsc channel in emission order
pub struct ChannelSink {
    tx: mpsc::Sender<PatternSignal>,
    stats: RwLock<SinkStats>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<PatternSignal>) -> Self {
        Self {
            tx,
            stats: RwLock::new(SinkStats::default()),
        }
    }

    /// Sink plus the receiving end of a fresh channel
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PatternSignal>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait::async_trait]
impl SignalSink for ChannelSink {
    async fn emit(&self, signal: &PatternSignal) -> Result<()> {
        self.tx
            .send(signal.clone())
            .await
            .map_err(|_| anyhow!("signal receiver dropped"))?;
        self.stats.write().await.record(signal);
        Ok(())
    }

    async fn stats(&self) -> Result<SinkStats> {
        Ok(self.stats.read().await.clone())
    }
}

/// In-memory signal log (for testing and replay analysis)
pub struct InMemorySink {
    signals: RwLock<Vec<PatternSignal>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self {
            signals: RwLock::new(Vec::new()),
        }
    }

    pub async fn get(&self, signal_id: Uuid) -> Option<PatternSignal> {
        let signals = self.signals.read().await;
        signals.iter().find(|s| s.id == signal_id).cloned()
    }

    pub async fn get_by_instrument(&self, instrument: Instrument) -> Vec<PatternSignal> {
        let signals = self.signals.read().await;
        signals
            .iter()
            .filter(|s| s.instrument == instrument)
            .cloned()
            .collect()
    }

    pub async fn get_by_time_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<PatternSignal> {
        let signals = self.signals.read().await;
        signals
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp <= end)
            .cloned()
            .collect()
    }

    /// Emission counts per pattern
    pub async fn count_by_pattern(&self) -> HashMap<PatternType, usize> {
        let signals = self.signals.read().await;
        let mut counts = HashMap::new();
        for signal in signals.iter() {
            *counts.entry(signal.pattern).or_insert(0) += 1;
        }
        counts
    }

    /// All signals in emission order
    pub async fn get_all(&self) -> Vec<PatternSignal> {
        self.signals.read().await.clone()
    }
}

impl Default for InMemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SignalSink for InMemorySink {
    async fn emit(&self, signal: &PatternSignal) -> Result<()> {
        self.signals.write().await.push(signal.clone());
        Ok(())
    }

    async fn stats(&self) -> Result<SinkStats> {
        let signals = self.signals.read().await;
        let mut stats = SinkStats::default();
        for signal in signals.iter() {
            stats.record(signal);
        }
        Ok(stats)
    }
}
