// JSON-lines output for accepted signals

use anyhow::Result;
use async_trait::async_trait;
use common::PatternSignal;
use signal_generation::{SignalSink, SinkStats};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{Mutex, RwLock};
use tracing::info;

type Output = Box<dyn AsyncWrite + Send + Unpin>;

/// Writes each signal as one JSON object per line, flushed per signal
pub struct JsonLinesSink {
    writer: Mutex<BufWriter<Output>>,
    stats: RwLock<SinkStats>,
}

impl JsonLinesSink {
    pub fn new(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        let output: Output = Box::new(writer);
        Self {
            writer: Mutex::new(BufWriter::new(output)),
            stats: RwLock::new(SinkStats::default()),
        }
    }

    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }

    /// Append to `path`, creating it if needed
    pub async fn append_file(path: &str) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        info!(path, "Writing accepted signals to file");
        Ok(Self::new(file))
    }
}

#[async_trait]
impl SignalSink for JsonLinesSink {
    async fn emit(&self, signal: &PatternSignal) -> Result<()> {
        let mut line = serde_json::to_vec(signal)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        drop(writer);

        self.stats.write().await.record(signal);
        Ok(())
    }

    async fn stats(&self) -> Result<SinkStats> {
        Ok(self.stats.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use common::{Instrument, PatternType, SignalDirection};

    fn create_test_signal(pattern: PatternType, secs: u32) -> PatternSignal {
        let ts = Utc.with_ymd_and_hms(2026, 3, 2, 13, 0, secs).unwrap();
        PatternSignal::new(pattern, Instrument::Wdo, SignalDirection::Short, 5012.5, ts)
    }

    #[tokio::test]
    async fn test_writes_one_line_per_signal() {
        let path = std::env::temp_dir().join(format!("tape-sink-{}.jsonl", std::process::id()));
        let path_str = path.to_str().unwrap().to_string();

        let sink = JsonLinesSink::append_file(&path_str).await.unwrap();
        let first = create_test_signal(PatternType::Absorption, 1);
        let second = create_test_signal(PatternType::Iceberg, 2);
        sink.emit(&first).await.unwrap();
        sink.emit(&second).await.unwrap();

        let written = tokio::fs::read_to_string(&path).await.unwrap();
        tokio::fs::remove_file(&path).await.unwrap();

        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        let decoded: PatternSignal = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(decoded.id, first.id);
        assert_eq!(decoded.pattern, PatternType::Absorption);

        let stats = sink.stats().await.unwrap();
        assert_eq!(stats.total_signals, 2);
        assert_eq!(stats.newest_signal, Some(second.timestamp));
    }
}
