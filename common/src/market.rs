// Market data records
// Trades and book snapshots are immutable once recorded

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The two correlated dollar futures tracked by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Instrument {
    /// Mini dollar future
    Wdo,
    /// Full dollar future
    Dol,
}

impl Instrument {
    pub const ALL: [Instrument; 2] = [Instrument::Wdo, Instrument::Dol];

    /// The correlated counterpart of this instrument
    pub fn paired(self) -> Self {
        match self {
            Instrument::Wdo => Instrument::Dol,
            Instrument::Dol => Instrument::Wdo,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Instrument::Wdo => "WDO",
            Instrument::Dol => "DOL",
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trade side from the aggressor's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn sign(self) -> i64 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }
}

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BookSide {
    Bid,
    Ask,
}

impl fmt::Display for BookSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookSide::Bid => f.write_str("bid"),
            BookSide::Ask => f.write_str("ask"),
        }
    }
}

/// Executed trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub timestamp: DateTime<Utc>,
    pub instrument: Instrument,
    pub side: Side,
    pub price: f64,
    pub volume: i64,
    #[serde(default = "default_aggressor")]
    pub aggressor: bool,
}

fn default_aggressor() -> bool {
    true
}

impl Trade {
    pub fn new(
        timestamp: DateTime<Utc>,
        instrument: Instrument,
        side: Side,
        price: f64,
        volume: i64,
    ) -> Self {
        Self {
            timestamp,
            instrument,
            side,
            price,
            volume,
            aggressor: true,
        }
    }

    /// Volume signed by side: positive for buys, negative for sells
    pub fn signed_volume(&self) -> i64 {
        self.side.sign() * self.volume
    }
}

/// One price level of the book
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub volume: i64,
}

impl BookLevel {
    pub fn new(price: f64, volume: i64) -> Self {
        Self { price, volume }
    }
}

/// Order book snapshot, bids and asks ordered best first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub timestamp: DateTime<Utc>,
    pub instrument: Instrument,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl BookSnapshot {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    pub fn levels(&self, side: BookSide) -> &[BookLevel] {
        match side {
            BookSide::Bid => &self.bids,
            BookSide::Ask => &self.asks,
        }
    }

    /// Aggregated volume of the first `depth` levels of one side
    pub fn side_volume(&self, side: BookSide, depth: usize) -> i64 {
        self.levels(side).iter().take(depth).map(|l| l.volume).sum()
    }

    pub fn total_volume(&self, side: BookSide) -> i64 {
        self.levels(side).iter().map(|l| l.volume).sum()
    }

    /// (bid - ask) / (bid + ask) over the whole book, 0 when empty
    pub fn imbalance(&self) -> f64 {
        let bid = self.total_volume(BookSide::Bid) as f64;
        let ask = self.total_volume(BookSide::Ask) as f64;
        if bid + ask > 0.0 {
            (bid - ask) / (bid + ask)
        } else {
            0.0
        }
    }

    /// Visible volume resting within `tolerance` of `price` on either side
    pub fn visible_volume_near(&self, price: f64, tolerance: f64) -> i64 {
        self.bids
            .iter()
            .chain(self.asks.iter())
            .filter(|l| (l.price - price).abs() <= tolerance)
            .map(|l| l.volume)
            .sum()
    }
}

/// A record arriving from the market-data feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketEvent {
    Trade(Trade),
    Book(BookSnapshot),
}

impl MarketEvent {
    pub fn instrument(&self) -> Instrument {
        match self {
            MarketEvent::Trade(t) => t.instrument,
            MarketEvent::Book(b) => b.instrument,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            MarketEvent::Trade(t) => t.timestamp,
            MarketEvent::Book(b) => b.timestamp,
        }
    }
}
