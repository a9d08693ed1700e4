use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use common::MarketEvent;

/// Reads one JSON record per line
///
/// Lines that do not parse are counted and skipped; blank lines are ignored.
pub struct JsonLinesReader<R, T> {
    reader: R,
    line: String,
    stats: FeedStats,
    _record: PhantomData<fn() -> T>,
}

/// Market event feed
pub type JsonLinesFeed<R> = JsonLinesReader<R, MarketEvent>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct FeedStats {
    pub lines: u64,
    pub events: u64,
    pub malformed: u64,
}

impl<R, T> JsonLinesReader<R, T>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            stats: FeedStats::default(),
            _record: PhantomData,
        }
    }

    /// Next well-formed record, or `None` at end of input
    pub async fn next_record(&mut self) -> Result<Option<T>> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line).await? == 0 {
                return Ok(None);
            }
            self.stats.lines += 1;

            let raw = self.line.trim();
            if raw.is_empty() {
                continue;
            }

            match serde_json::from_str::<T>(raw) {
                Ok(record) => {
                    self.stats.events += 1;
                    return Ok(Some(record));
                }
                Err(e) => {
                    self.stats.malformed += 1;
                    warn!(line = self.stats.lines, error = %e, "Skipping malformed feed line");
                }
            }
        }
    }

    /// Forward every record into `tx` until input ends or the receiver goes away
    pub async fn run(mut self, tx: mpsc::Sender<T>) -> Result<FeedStats> {
        while let Some(record) = self.next_record().await? {
            if tx.send(record).await.is_err() {
                info!("Feed receiver dropped, stopping");
                break;
            }
        }

        info!(
            lines = self.stats.lines,
            events = self.stats.events,
            malformed = self.stats.malformed,
            "Feed finished"
        );
        Ok(self.stats)
    }

    pub fn stats(&self) -> &FeedStats {
        &self.stats
    }
}

/// Reader replaying a file
pub async fn open_file<T: DeserializeOwned>(path: &str) -> Result<JsonLinesReader<BufReader<tokio::fs::File>, T>> {
    let file = tokio::fs::File::open(path).await?;
    info!(path, "Opened JSON-lines file");
    Ok(JsonLinesReader::new(BufReader::new(file)))
}

/// Feed reading standard input
pub fn stdin() -> JsonLinesFeed<BufReader<tokio::io::Stdin>> {
    JsonLinesFeed::new(BufReader::new(tokio::io::stdin()))
}
