// Book dynamics detectors
// Compare the two most recent snapshots (or the snapshot history for flash orders)

use chrono::{DateTime, Utc};
use common::{BookLevel, BookSide, BookSnapshot, PatternSignal, PatternType, SignalDirection};
use serde_json::json;

use super::{ensure_finite, price_key, DetectionResult};
use crate::config::BookDynamicsConfig;
use crate::market_state::InstrumentSnapshot;

fn volume_at(levels: &[BookLevel], price: f64) -> Option<i64> {
    let key = price_key(price);
    levels.iter().find(|l| price_key(l.price) == key).map(|l| l.volume)
}

/// Price lies between the best and the worst visible level of the side
fn within_visible_range(book: &BookSnapshot, side: BookSide, price: f64) -> bool {
    let levels = book.levels(side);
    let (Some(best), Some(worst)) = (levels.first(), levels.last()) else {
        return false;
    };
    let (low, high) = if best.price <= worst.price {
        (best.price, worst.price)
    } else {
        (worst.price, best.price)
    };
    price >= low && price <= high
}

fn top_levels(book: &BookSnapshot, side: BookSide, depth: usize) -> &[BookLevel] {
    let levels = book.levels(side);
    &levels[..levels.len().min(depth)]
}

fn book_signal_price(book: &BookSnapshot) -> Option<f64> {
    match (book.best_bid(), book.best_ask()) {
        (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
        (Some(p), None) | (None, Some(p)) => Some(p),
        (None, None) => None,
    }
}

/// Resting liquidity withdrawn between two snapshots
#[derive(Debug, Clone)]
pub struct BookPullingDetector {
    config: BookDynamicsConfig,
}

impl BookPullingDetector {
    pub fn new(config: BookDynamicsConfig) -> Self {
        Self { config }
    }

    pub fn detect(&self, snapshot: &InstrumentSnapshot, now: DateTime<Utc>) -> DetectionResult {
        let (Some(previous), Some(latest)) = (snapshot.previous_book(), snapshot.latest_book()) else {
            return Ok(None);
        };

        // (side, price, previous volume, current volume)
        let mut best: Option<(BookSide, f64, i64, i64)> = None;
        for side in [BookSide::Bid, BookSide::Ask] {
            for level in top_levels(previous, side, self.config.depth) {
                if level.volume <= self.config.pulling_min_volume {
                    continue;
                }
                let current = match volume_at(latest.levels(side), level.price) {
                    Some(volume) => volume,
                    None if within_visible_range(latest, side, level.price) => 0,
                    None => continue,
                };
                let drop = (level.volume - current) as f64 / level.volume as f64;
                if drop < self.config.pulling_drop {
                    continue;
                }
                let pulled = level.volume - current;
                if best.map_or(true, |(_, _, prev, cur)| pulled > prev - cur) {
                    best = Some((side, level.price, level.volume, current));
                }
            }
        }

        let Some((side, level_price, previous_volume, current_volume)) = best else {
            return Ok(None);
        };
        let drop = (previous_volume - current_volume) as f64 / previous_volume as f64;
        // support leaving the bid is bearish
        let direction = match side {
            BookSide::Bid => SignalDirection::Short,
            BookSide::Ask => SignalDirection::Long,
        };
        let Some(price) = book_signal_price(latest) else {
            return Ok(None);
        };

        Ok(Some(
            PatternSignal::new(PatternType::BookPulling, snapshot.instrument, direction, price, now)
                .with_strength(drop)
                .with_confidence(0.4 + 0.2 * drop)
                .with_evidence(json!({
                    "side": side.to_string(),
                    "level": level_price,
                    "previous_volume": previous_volume,
                    "current_volume": current_volume,
                    "drop": drop,
                })),
        ))
    }
}

/// Resting liquidity added between two snapshots
#[derive(Debug, Clone)]
pub struct BookStackingDetector {
    config: BookDynamicsConfig,
}

impl BookStackingDetector {
    pub fn new(config: BookDynamicsConfig) -> Self {
        Self { config }
    }

    pub fn detect(&self, snapshot: &InstrumentSnapshot, now: DateTime<Utc>) -> DetectionResult {
        let (Some(previous), Some(latest)) = (snapshot.previous_book(), snapshot.latest_book()) else {
            return Ok(None);
        };

        let mut best: Option<(BookSide, f64, i64, i64, f64)> = None;
        for side in [BookSide::Bid, BookSide::Ask] {
            for level in top_levels(latest, side, self.config.depth) {
                if level.volume <= self.config.stacking_min_volume {
                    continue;
                }
                let Some(before) = volume_at(previous.levels(side), level.price) else {
                    continue;
                };
                let ratio = level.volume as f64 / before as f64;
                if ratio < self.config.stacking_ratio {
                    continue;
                }
                if best.map_or(true, |(.., r)| ratio > r) {
                    best = Some((side, level.price, before, level.volume, ratio));
                }
            }
        }

        let Some((side, level_price, previous_volume, current_volume, ratio)) = best else {
            return Ok(None);
        };
        let direction = match side {
            BookSide::Bid => SignalDirection::Long,
            BookSide::Ask => SignalDirection::Short,
        };
        let Some(price) = book_signal_price(latest) else {
            return Ok(None);
        };

        Ok(Some(
            PatternSignal::new(PatternType::BookStacking, snapshot.instrument, direction, price, now)
                .with_strength(ratio / (self.config.stacking_ratio * 2.0))
                .with_confidence(0.45)
                .with_evidence(json!({
                    "side": side.to_string(),
                    "level": level_price,
                    "previous_volume": previous_volume,
                    "current_volume": current_volume,
                    "ratio": ratio,
                })),
        ))
    }
}

/// Large order that appeared and vanished within a short lifetime
#[derive(Debug, Clone)]
pub struct FlashOrderDetector {
    config: BookDynamicsConfig,
}

impl FlashOrderDetector {
    pub fn new(config: BookDynamicsConfig) -> Self {
        Self { config }
    }

    fn holds_large(&self, book: &BookSnapshot, side: BookSide, price: f64) -> bool {
        volume_at(book.levels(side), price).map_or(false, |v| v > self.config.flash_min_volume)
    }

    pub fn detect(&self, snapshot: &InstrumentSnapshot, now: DateTime<Utc>) -> DetectionResult {
        let books = &snapshot.books;
        if books.len() < 3 {
            return Ok(None);
        }
        let latest_index = books.len() - 1;
        let (Some(previous), Some(latest)) = (books.get(latest_index - 1), books.get(latest_index)) else {
            return Ok(None);
        };

        for side in [BookSide::Bid, BookSide::Ask] {
            for level in previous.levels(side) {
                if level.volume <= self.config.flash_min_volume || self.holds_large(latest, side, level.price) {
                    continue;
                }

                // walk back to the first snapshot of the unbroken run holding the order
                let mut first_seen = latest_index - 1;
                while first_seen > 0 && self.holds_large(&books[first_seen - 1], side, level.price) {
                    first_seen -= 1;
                }
                if first_seen == 0 {
                    // present since the start of history, appearance unknown
                    continue;
                }

                let lifetime = (latest.timestamp - books[first_seen].timestamp).num_milliseconds() as f64 / 1000.0;
                let lifetime = ensure_finite(PatternType::FlashOrder, "lifetime", lifetime)?;
                if lifetime > self.config.flash_max_lifetime_secs {
                    continue;
                }

                // a vanished bid was fake support
                let direction = match side {
                    BookSide::Bid => SignalDirection::Short,
                    BookSide::Ask => SignalDirection::Long,
                };
                let Some(price) = book_signal_price(latest) else {
                    return Ok(None);
                };
                return Ok(Some(
                    PatternSignal::new(PatternType::FlashOrder, snapshot.instrument, direction, price, now)
                        .with_strength((level.volume as f64 / (self.config.flash_min_volume as f64 * 4.0)).min(1.0))
                        .with_confidence(0.4)
                        .with_evidence(json!({
                            "side": side.to_string(),
                            "level": level.price,
                            "volume": level.volume,
                            "lifetime_secs": lifetime,
                        })),
                ));
            }
        }
        Ok(None)
    }
}

/// Sudden change of book imbalance
#[derive(Debug, Clone)]
pub struct ImbalanceShiftDetector {
    config: BookDynamicsConfig,
}

impl ImbalanceShiftDetector {
    pub fn new(config: BookDynamicsConfig) -> Self {
        Self { config }
    }

    pub fn detect(&self, snapshot: &InstrumentSnapshot, now: DateTime<Utc>) -> DetectionResult {
        let (Some(previous), Some(latest)) = (snapshot.previous_book(), snapshot.latest_book()) else {
            return Ok(None);
        };
        let before = previous.imbalance();
        let after = latest.imbalance();
        let shift = ensure_finite(PatternType::ImbalanceShift, "imbalance_shift", after - before)?;
        if shift.abs() < self.config.imbalance_shift {
            return Ok(None);
        }

        let Some(price) = book_signal_price(latest) else {
            return Ok(None);
        };
        Ok(Some(
            PatternSignal::new(
                PatternType::ImbalanceShift,
                snapshot.instrument,
                SignalDirection::from_signed(shift),
                price,
                now,
            )
            .with_strength(shift.abs())
            .with_confidence(0.4 + 0.2 * shift.abs())
            .with_evidence(json!({
                "previous_imbalance": before,
                "current_imbalance": after,
                "shift": shift,
            })),
        ))
    }
}
