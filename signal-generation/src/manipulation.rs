//! Manipulation filter
//!
//! Looks for layering and spoofing in the same book snapshot the detectors
//! saw, then penalizes or blocks that instrument's candidates.

use chrono::{DateTime, Utc};
use common::{
    BookSide, BookSnapshot, FilterAction, Instrument, ManipulationKind, ObservabilityEvent,
    PatternSignal,
};
use statrs::statistics::Statistics;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::ManipulationConfig;
use crate::market_state::MarketSnapshot;

/// A manipulation pattern found on one side of a book
#[derive(Debug, Clone, PartialEq)]
pub struct ManipulationFlag {
    pub instrument: Instrument,
    pub kind: ManipulationKind,
    pub side: BookSide,
    pub action: FilterAction,
    pub penalty: f64,
    /// Levels in the layer, or depth used for the spoofing ratio
    pub affected: usize,
    /// Coefficient of variation for layering, volume ratio for spoofing
    pub metric: f64,
    pub book_timestamp: DateTime<Utc>,
}

impl ManipulationFlag {
    pub fn to_event(&self, timestamp: DateTime<Utc>) -> ObservabilityEvent {
        ObservabilityEvent::ManipulationFlagged {
            timestamp,
            instrument: self.instrument,
            kind: self.kind,
            side: self.side,
            action: self.action,
            affected: self.affected,
            metric: self.metric,
        }
    }
}

/// Result of filtering one cycle's candidates
#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub passed: Vec<PatternSignal>,
    pub blocked: Vec<PatternSignal>,
    /// Flags not reported before for their book snapshot
    pub new_flags: Vec<ManipulationFlag>,
}

pub struct ManipulationFilter {
    config: ManipulationConfig,
    last_reported: HashMap<(Instrument, ManipulationKind), DateTime<Utc>>,
}

impl ManipulationFilter {
    pub fn new(config: ManipulationConfig) -> Self {
        Self {
            config,
            last_reported: HashMap::new(),
        }
    }

    /// Longest run of uniform, sizeable levels from the top of one side
    fn detect_layering(&self, book: &BookSnapshot, side: BookSide) -> Option<(usize, f64)> {
        let layering = &self.config.layering;
        let levels = book.levels(side);
        let scan = &levels[..levels.len().min(layering.scan_depth)];

        let mut best: Option<(usize, f64)> = None;
        for start in 0..scan.len() {
            let mut volumes = Vec::new();
            for level in &scan[start..] {
                if level.volume < layering.min_level_volume {
                    break;
                }
                volumes.push(level.volume as f64);
                if volumes.len() < layering.min_levels {
                    continue;
                }
                let cv = volumes.iter().population_std_dev() / volumes.iter().mean();
                if !(cv <= layering.max_uniformity) {
                    break;
                }
                if best.map_or(true, |(len, _)| volumes.len() > len) {
                    best = Some((volumes.len(), cv));
                }
            }
        }
        best
    }

    /// Heavier side over lighter side across the top levels
    fn detect_spoofing(&self, book: &BookSnapshot) -> Option<(BookSide, f64)> {
        let depth = self.config.spoofing.depth;
        let bid = book.side_volume(BookSide::Bid, depth);
        let ask = book.side_volume(BookSide::Ask, depth);
        let (heavy_side, heavy, light) = if bid >= ask {
            (BookSide::Bid, bid, ask)
        } else {
            (BookSide::Ask, ask, bid)
        };
        if light <= 0 {
            return None;
        }
        let ratio = heavy as f64 / light as f64;
        (ratio >= self.config.spoofing.min_ratio).then_some((heavy_side, ratio))
    }

    /// All flags raised by a book
    pub fn scan(&self, book: &BookSnapshot) -> Vec<ManipulationFlag> {
        let mut flags = Vec::new();

        if self.config.layering.enabled {
            for side in [BookSide::Bid, BookSide::Ask] {
                if let Some((levels, cv)) = self.detect_layering(book, side) {
                    flags.push(ManipulationFlag {
                        instrument: book.instrument,
                        kind: ManipulationKind::Layering,
                        side,
                        action: self.config.layering.action,
                        penalty: self.config.layering.penalty,
                        affected: levels,
                        metric: cv,
                        book_timestamp: book.timestamp,
                    });
                }
            }
        }

        if self.config.spoofing.enabled {
            if let Some((side, ratio)) = self.detect_spoofing(book) {
                flags.push(ManipulationFlag {
                    instrument: book.instrument,
                    kind: ManipulationKind::Spoofing,
                    side,
                    action: self.config.spoofing.action,
                    penalty: self.config.spoofing.penalty,
                    affected: self.config.spoofing.depth,
                    metric: ratio,
                    book_timestamp: book.timestamp,
                });
            }
        }
        flags
    }

    /// Penalize or block candidates using the snapshot's latest books
    pub fn apply(&mut self, market: &MarketSnapshot, candidates: Vec<PatternSignal>) -> FilterOutcome {
        let mut outcome = FilterOutcome::default();
        let mut flags_by_instrument: HashMap<Instrument, Vec<ManipulationFlag>> = HashMap::new();

        for instrument in Instrument::ALL {
            let Some(book) = market.instrument(instrument).latest_book() else {
                continue;
            };
            let flags = self.scan(book);
            for flag in &flags {
                let key = (flag.instrument, flag.kind);
                if self.last_reported.get(&key) != Some(&flag.book_timestamp) {
                    warn!(
                        instrument = %flag.instrument,
                        kind = %flag.kind,
                        side = %flag.side,
                        metric = flag.metric,
                        "Manipulation flagged"
                    );
                    self.last_reported.insert(key, flag.book_timestamp);
                    outcome.new_flags.push(flag.clone());
                }
            }
            flags_by_instrument.insert(instrument, flags);
        }

        for mut signal in candidates {
            let flags = flags_by_instrument
                .get(&signal.instrument)
                .map(Vec::as_slice)
                .unwrap_or_default();

            if flags.iter().any(|f| f.action == FilterAction::Block) {
                debug!(pattern = %signal.pattern, instrument = %signal.instrument, "Candidate blocked by manipulation filter");
                outcome.blocked.push(signal);
                continue;
            }
            // one penalty per candidate, the harshest raised
            if let Some(penalty) = flags.iter().map(|f| f.penalty).reduce(f64::max) {
                signal.penalize(penalty);
            }
            for flag in flags {
                signal.annotate(format!("{}:{}", flag.kind, flag.side));
            }
            outcome.passed.push(signal);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LayeringConfig, MarketStateConfig, SpoofingConfig};
    use crate::market_state::RollingMarketState;
    use chrono::TimeZone;
    use common::{BookLevel, PatternType, SignalDirection};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn create_test_book(secs: i64, bids: &[i64], asks: &[i64]) -> BookSnapshot {
        BookSnapshot {
            timestamp: ts(secs),
            instrument: Instrument::Wdo,
            bids: bids
                .iter()
                .enumerate()
                .map(|(i, v)| BookLevel::new(4999.5 - i as f64 * 0.5, *v))
                .collect(),
            asks: asks
                .iter()
                .enumerate()
                .map(|(i, v)| BookLevel::new(5000.0 + i as f64 * 0.5, *v))
                .collect(),
        }
    }

    fn create_test_signal(instrument: Instrument) -> PatternSignal {
        PatternSignal::new(PatternType::Pressure, instrument, SignalDirection::Long, 5000.0, ts(1))
            .with_confidence(0.8)
    }

    fn snapshot_with(books: Vec<BookSnapshot>) -> MarketSnapshot {
        let mut state = RollingMarketState::new(MarketStateConfig::default());
        for book in books {
            state.append_book(book).unwrap();
        }
        state.snapshot()
    }

    fn layering_only() -> ManipulationConfig {
        ManipulationConfig {
            layering: LayeringConfig::default(),
            spoofing: SpoofingConfig {
                enabled: false,
                ..SpoofingConfig::default()
            },
        }
    }

    #[test]
    fn test_layering_flags_and_penalizes() {
        let market = snapshot_with(vec![create_test_book(0, &[100, 100, 100, 100], &[120, 30, 90, 60])]);
        let mut filter = ManipulationFilter::new(layering_only());

        let outcome = filter.apply(
            &market,
            vec![create_test_signal(Instrument::Wdo), create_test_signal(Instrument::Dol)],
        );

        assert_eq!(outcome.new_flags.len(), 1);
        let flag = &outcome.new_flags[0];
        assert_eq!(flag.kind, ManipulationKind::Layering);
        assert_eq!(flag.side, BookSide::Bid);
        assert_eq!(flag.affected, 4);

        assert_eq!(outcome.passed.len(), 2);
        let wdo = &outcome.passed[0];
        assert!((wdo.confidence() - 0.48).abs() < 1e-9);
        assert_eq!(wdo.annotations, vec!["layering:bid".to_string()]);
        // the other instrument's book is clean
        assert_eq!(outcome.passed[1].confidence(), 0.8);
    }

    #[test]
    fn test_both_sides_layered_penalize_once() {
        let market = snapshot_with(vec![create_test_book(0, &[100, 100, 100, 100], &[80, 80, 80, 80])]);
        let mut filter = ManipulationFilter::new(layering_only());

        let outcome = filter.apply(&market, vec![create_test_signal(Instrument::Wdo)]);

        let wdo = &outcome.passed[0];
        assert!((wdo.confidence() - 0.48).abs() < 1e-9);
        assert_eq!(wdo.annotations, vec!["layering:bid".to_string(), "layering:ask".to_string()]);
    }

    #[test]
    fn test_short_or_uneven_runs_are_not_layering() {
        let filter = ManipulationFilter::new(layering_only());
        assert!(filter.scan(&create_test_book(0, &[100, 100, 100], &[80])).is_empty());
        assert!(filter.scan(&create_test_book(0, &[100, 150, 60, 100], &[80])).is_empty());
        assert!(filter.scan(&create_test_book(0, &[40, 40, 40, 40], &[80])).is_empty());
    }

    #[test]
    fn test_spoofing_block() {
        let config = ManipulationConfig {
            layering: LayeringConfig {
                enabled: false,
                ..LayeringConfig::default()
            },
            spoofing: SpoofingConfig {
                action: FilterAction::Block,
                ..SpoofingConfig::default()
            },
        };
        let market = snapshot_with(vec![create_test_book(0, &[500, 300, 200], &[40, 30, 30])]);
        let mut filter = ManipulationFilter::new(config);

        let outcome = filter.apply(&market, vec![create_test_signal(Instrument::Wdo)]);
        assert!(outcome.passed.is_empty());
        assert_eq!(outcome.blocked.len(), 1);
        assert_eq!(outcome.new_flags[0].side, BookSide::Bid);
        assert_eq!(outcome.new_flags[0].metric, 10.0);
    }

    #[test]
    fn test_flag_reported_once_per_book() {
        let market = snapshot_with(vec![create_test_book(0, &[100, 100, 100, 100], &[120, 30, 90, 60])]);
        let mut filter = ManipulationFilter::new(layering_only());

        assert_eq!(filter.apply(&market, Vec::new()).new_flags.len(), 1);
        assert!(filter.apply(&market, Vec::new()).new_flags.is_empty());
    }
}
