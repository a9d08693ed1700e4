//! Rolling market state
//!
//! Bounded per-instrument trade and book history with a cumulative volume
//! delta (CVD) accumulator. Consumers only ever see [`MarketSnapshot`]s,
//! which share the buffers copy-on-write.

use chrono::{DateTime, Duration, Utc};
use common::{BookSide, BookSnapshot, IngestError, Instrument, MarketEvent, Trade};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::MarketStateConfig;

/// Cumulative signed volume with a bounded history of points
#[derive(Debug, Clone)]
pub struct CvdState {
    value: i64,
    history: VecDeque<(DateTime<Utc>, i64)>,
    capacity: usize,
    /// CVD just before the oldest retained point
    evicted: i64,
}

impl CvdState {
    pub fn new(capacity: usize) -> Self {
        Self {
            value: 0,
            history: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            evicted: 0,
        }
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn apply(&mut self, timestamp: DateTime<Utc>, signed_volume: i64) {
        self.value += signed_volume;
        if self.history.len() == self.capacity {
            if let Some((_, value)) = self.history.pop_front() {
                self.evicted = value;
            }
        }
        self.history.push_back((timestamp, self.value));
    }

    /// Change in CVD over the trailing `period`, in contracts
    ///
    /// The base is the last point at or before the start of the period; with
    /// a shorter history it is the value preceding the oldest retained point.
    pub fn rate_of_change(&self, period: Duration) -> f64 {
        let Some(&(latest, current)) = self.history.back() else {
            return 0.0;
        };
        let cutoff = latest - period;

        let base = self
            .history
            .iter()
            .rev()
            .find(|(ts, _)| *ts <= cutoff)
            .map(|&(_, value)| value)
            .unwrap_or(self.evicted);
        (current - base) as f64
    }
}

/// Live state of one instrument
#[derive(Debug, Clone)]
struct InstrumentState {
    trades: Arc<VecDeque<Trade>>,
    books: Arc<VecDeque<BookSnapshot>>,
    cvd: CvdState,
    trade_count: u64,
    last_timestamp: Option<DateTime<Utc>>,
}

impl InstrumentState {
    fn new(config: &MarketStateConfig) -> Self {
        Self {
            trades: Arc::new(VecDeque::new()),
            books: Arc::new(VecDeque::new()),
            cvd: CvdState::new(config.cvd_capacity),
            trade_count: 0,
            last_timestamp: None,
        }
    }

    fn check_monotonic(&self, instrument: Instrument, timestamp: DateTime<Utc>) -> Result<(), IngestError> {
        match self.last_timestamp {
            Some(last) if timestamp < last => Err(IngestError::NonMonotonicTimestamp {
                instrument,
                timestamp,
                last,
            }),
            _ => Ok(()),
        }
    }
}

/// Read-only view of one instrument
#[derive(Debug, Clone)]
pub struct InstrumentSnapshot {
    pub instrument: Instrument,
    pub trades: Arc<VecDeque<Trade>>,
    pub books: Arc<VecDeque<BookSnapshot>>,
    pub cvd: i64,
    pub cvd_roc: f64,
    /// Trades accepted since start, evicted ones included
    pub trade_count: u64,
    pub last_timestamp: Option<DateTime<Utc>>,
}

impl InstrumentSnapshot {
    fn empty(instrument: Instrument) -> Self {
        Self {
            instrument,
            trades: Arc::new(VecDeque::new()),
            books: Arc::new(VecDeque::new()),
            cvd: 0,
            cvd_roc: 0.0,
            trade_count: 0,
            last_timestamp: None,
        }
    }

    pub fn last_trade(&self) -> Option<&Trade> {
        self.trades.back()
    }

    pub fn last_price(&self) -> Option<f64> {
        self.trades.back().map(|t| t.price)
    }

    pub fn latest_book(&self) -> Option<&BookSnapshot> {
        self.books.back()
    }

    pub fn previous_book(&self) -> Option<&BookSnapshot> {
        let len = self.books.len();
        if len < 2 {
            return None;
        }
        self.books.get(len - 2)
    }

    /// The last `n` trades, oldest first
    pub fn recent_trades(&self, n: usize) -> impl Iterator<Item = &Trade> {
        let skip = self.trades.len().saturating_sub(n);
        self.trades.iter().skip(skip)
    }

    /// Trades with timestamp strictly after `since`
    pub fn trades_since(&self, since: DateTime<Utc>) -> impl Iterator<Item = &Trade> {
        let start = self.trades.partition_point(|t| t.timestamp <= since);
        self.trades.range(start..)
    }

    /// Trades accepted after the first `consumed` of the stream, oldest first
    ///
    /// Counts position rather than time, so trades sharing a timestamp are
    /// never skipped. Trades already evicted from the buffer are gone.
    pub fn trades_after_count(&self, consumed: u64) -> impl Iterator<Item = &Trade> {
        let held = self.trades.len() as u64;
        let first_held = self.trade_count.saturating_sub(held);
        let skip = consumed.saturating_sub(first_held).min(held) as usize;
        self.trades.range(skip..)
    }

    /// Trades inside the trailing window ending at the latest trade
    pub fn trades_in_window(&self, window: Duration) -> impl Iterator<Item = &Trade> {
        let cutoff = self
            .trades
            .back()
            .map(|t| t.timestamp - window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let start = self.trades.partition_point(|t| t.timestamp < cutoff);
        self.trades.range(start..)
    }
}

/// Consistent view of both instruments at one point of the stream
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    wdo: InstrumentSnapshot,
    dol: InstrumentSnapshot,
}

impl MarketSnapshot {
    pub fn empty() -> Self {
        Self {
            sequence: 0,
            timestamp: DateTime::<Utc>::MIN_UTC,
            wdo: InstrumentSnapshot::empty(Instrument::Wdo),
            dol: InstrumentSnapshot::empty(Instrument::Dol),
        }
    }

    pub fn instrument(&self, instrument: Instrument) -> &InstrumentSnapshot {
        match instrument {
            Instrument::Wdo => &self.wdo,
            Instrument::Dol => &self.dol,
        }
    }

    pub fn has_data(&self) -> bool {
        self.sequence > 0
    }
}

/// Ingestion counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestStats {
    pub accepted_trades: u64,
    pub accepted_books: u64,
    pub rejected: BTreeMap<String, u64>,
}

impl IngestStats {
    pub fn total_rejected(&self) -> u64 {
        self.rejected.values().sum()
    }
}

/// Single-writer rolling state for both instruments
pub struct RollingMarketState {
    config: MarketStateConfig,
    wdo: InstrumentState,
    dol: InstrumentState,
    sequence: u64,
    last_timestamp: Option<DateTime<Utc>>,
    stats: IngestStats,
}

impl RollingMarketState {
    pub fn new(config: MarketStateConfig) -> Self {
        Self {
            wdo: InstrumentState::new(&config),
            dol: InstrumentState::new(&config),
            config,
            sequence: 0,
            last_timestamp: None,
            stats: IngestStats::default(),
        }
    }

    fn state_mut(&mut self, instrument: Instrument) -> &mut InstrumentState {
        match instrument {
            Instrument::Wdo => &mut self.wdo,
            Instrument::Dol => &mut self.dol,
        }
    }

    /// Validate and apply one market event
    pub fn apply(&mut self, event: MarketEvent) -> Result<(), IngestError> {
        match event {
            MarketEvent::Trade(trade) => self.append_trade(trade),
            MarketEvent::Book(book) => self.append_book(book),
        }
    }

    pub fn append_trade(&mut self, trade: Trade) -> Result<(), IngestError> {
        if let Err(e) = self.validate_trade(&trade) {
            self.reject(&e);
            return Err(e);
        }

        let capacity = self.config.trade_capacity;
        let timestamp = trade.timestamp;
        let state = self.state_mut(trade.instrument);
        state.cvd.apply(timestamp, trade.signed_volume());
        let trades = Arc::make_mut(&mut state.trades);
        if trades.len() == capacity {
            trades.pop_front();
        }
        trades.push_back(trade);
        state.trade_count += 1;
        state.last_timestamp = Some(timestamp);

        self.stats.accepted_trades += 1;
        self.advance(timestamp);
        Ok(())
    }

    pub fn append_book(&mut self, book: BookSnapshot) -> Result<(), IngestError> {
        if let Err(e) = self.validate_book(&book) {
            self.reject(&e);
            return Err(e);
        }

        let capacity = self.config.book_capacity;
        let timestamp = book.timestamp;
        let state = self.state_mut(book.instrument);
        let books = Arc::make_mut(&mut state.books);
        if books.len() == capacity {
            books.pop_front();
        }
        books.push_back(book);
        state.last_timestamp = Some(timestamp);

        self.stats.accepted_books += 1;
        self.advance(timestamp);
        Ok(())
    }

    fn advance(&mut self, timestamp: DateTime<Utc>) {
        self.sequence += 1;
        self.last_timestamp = Some(self.last_timestamp.map_or(timestamp, |t| t.max(timestamp)));
    }

    fn validate_trade(&self, trade: &Trade) -> Result<(), IngestError> {
        if trade.volume <= 0 {
            return Err(IngestError::NonPositiveVolume {
                instrument: trade.instrument,
                volume: trade.volume,
            });
        }
        if !(trade.price.is_finite() && trade.price > 0.0) {
            return Err(IngestError::NonPositivePrice {
                instrument: trade.instrument,
                price: trade.price,
            });
        }
        self.instrument_state(trade.instrument)
            .check_monotonic(trade.instrument, trade.timestamp)
    }

    fn validate_book(&self, book: &BookSnapshot) -> Result<(), IngestError> {
        for side in [BookSide::Bid, BookSide::Ask] {
            let levels = book.levels(side);
            if levels.is_empty() {
                return Err(IngestError::EmptyBookSide {
                    instrument: book.instrument,
                    side,
                });
            }
            for level in levels {
                if !(level.price.is_finite() && level.price > 0.0) {
                    return Err(IngestError::NonPositivePrice {
                        instrument: book.instrument,
                        price: level.price,
                    });
                }
                if level.volume <= 0 {
                    return Err(IngestError::NonPositiveVolume {
                        instrument: book.instrument,
                        volume: level.volume,
                    });
                }
            }
        }
        self.instrument_state(book.instrument)
            .check_monotonic(book.instrument, book.timestamp)
    }

    fn instrument_state(&self, instrument: Instrument) -> &InstrumentState {
        match instrument {
            Instrument::Wdo => &self.wdo,
            Instrument::Dol => &self.dol,
        }
    }

    fn reject(&mut self, error: &IngestError) {
        warn!(reason = error.kind(), "Rejected market event: {}", error);
        *self.stats.rejected.entry(error.kind().to_string()).or_insert(0) += 1;
    }

    pub fn rate_of_change(&self, instrument: Instrument, period: Duration) -> f64 {
        self.instrument_state(instrument).cvd.rate_of_change(period)
    }

    /// Immutable view sharing the current buffers
    pub fn snapshot(&self) -> MarketSnapshot {
        let period = Duration::seconds(self.config.cvd_roc_period_secs as i64);
        let view = |instrument: Instrument, state: &InstrumentState| InstrumentSnapshot {
            instrument,
            trades: Arc::clone(&state.trades),
            books: Arc::clone(&state.books),
            cvd: state.cvd.value(),
            cvd_roc: state.cvd.rate_of_change(period),
            trade_count: state.trade_count,
            last_timestamp: state.last_timestamp,
        };

        debug!(sequence = self.sequence, "Publishing market snapshot");
        MarketSnapshot {
            sequence: self.sequence,
            timestamp: self.last_timestamp.unwrap_or(DateTime::<Utc>::MIN_UTC),
            wdo: view(Instrument::Wdo, &self.wdo),
            dol: view(Instrument::Dol, &self.dol),
        }
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }
}
