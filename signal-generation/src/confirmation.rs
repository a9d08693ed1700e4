//! Confirmation tracker
//!
//! Holds candidates of confirmable patterns until a pattern-specific
//! predicate confirms them, evidence invalidates them, or their deadline
//! passes. Each entry resolves exactly once and is dropped on resolution.

use chrono::{DateTime, Duration, Utc};
use common::{ConfirmationOutcome, Instrument, ObservabilityEvent, PatternSignal, PatternType, Trade};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ConfirmationConfig;
use crate::market_state::{InstrumentSnapshot, MarketSnapshot};

type PendingKey = (PatternType, Instrument);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingState {
    Pending,
    Confirmed,
    Expired,
    Invalidated,
}

/// Why a candidate could not be admitted as pending
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingRejection {
    NotConfirmable(PatternType),
    AlreadyPending(PatternType, Instrument),
    CapacityReached(usize),
}

impl fmt::Display for PendingRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingRejection::NotConfirmable(p) => write!(f, "{} has no confirmation rule", p),
            PendingRejection::AlreadyPending(p, i) => write!(f, "{} already pending on {}", p, i),
            PendingRejection::CapacityReached(cap) => write!(f, "pending capacity {} reached", cap),
        }
    }
}

impl PendingRejection {
    pub fn to_event(&self, signal: &PatternSignal, timestamp: DateTime<Utc>) -> ObservabilityEvent {
        ObservabilityEvent::PendingRejected {
            timestamp,
            signal_id: signal.id,
            pattern: signal.pattern,
            instrument: signal.instrument,
            reason: self.to_string(),
        }
    }
}

/// Per-rule counters carried between checks
#[derive(Debug, Clone, PartialEq)]
enum Progress {
    Absorption { tests: usize },
    Divergence { holding_ticks: usize },
    Momentum { signed_volume: i64 },
    Institutional,
    HiddenLiquidity { reload_ticks: usize },
}

impl Progress {
    fn for_pattern(pattern: PatternType) -> Option<Self> {
        match pattern {
            PatternType::Absorption => Some(Progress::Absorption { tests: 0 }),
            PatternType::Divergence => Some(Progress::Divergence { holding_ticks: 0 }),
            PatternType::MomentumExtreme => Some(Progress::Momentum { signed_volume: 0 }),
            PatternType::InstitutionalFootprint => Some(Progress::Institutional),
            PatternType::HiddenLiquidity => Some(Progress::HiddenLiquidity { reload_ticks: 0 }),
            _ => None,
        }
    }
}

enum Verdict {
    Pending,
    Confirmed,
    Invalidated(String),
}

#[derive(Debug, Clone)]
pub struct PendingConfirmation {
    pub signal: PatternSignal,
    pub admitted_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub checks: u32,
    /// Trade ordinal already evaluated; `None` until the first check
    consumed_trades: Option<u64>,
    progress: Progress,
}

impl PendingConfirmation {
    fn evidence(&self, key: &str) -> Result<f64, String> {
        self.signal
            .evidence_f64(key)
            .ok_or_else(|| format!("missing evidence '{}'", key))
    }

    fn evaluate(&mut self, rules: &ConfirmationConfig, snapshot: &InstrumentSnapshot, now: DateTime<Utc>) -> Verdict {
        self.checks += 1;
        let fresh: Vec<&Trade> = match self.consumed_trades {
            Some(consumed) => snapshot.trades_after_count(consumed).collect(),
            None => snapshot.trades_since(self.signal.timestamp).collect(),
        };
        self.consumed_trades = Some(snapshot.trade_count);
        match self.judge(rules, snapshot, &fresh, now) {
            Ok(verdict) => verdict,
            Err(reason) => Verdict::Invalidated(reason),
        }
    }

    fn judge(
        &mut self,
        rules: &ConfirmationConfig,
        snapshot: &InstrumentSnapshot,
        fresh: &[&Trade],
        now: DateTime<Utc>,
    ) -> Result<Verdict, String> {
        let sign = self.signal.direction.sign();
        let original = self.signal.price;

        match self.progress {
            Progress::Absorption { ref mut tests } => {
                let rule = &rules.absorption;
                let level = self.signal.evidence_f64("level").ok_or("missing evidence 'level'")?;
                let average = self
                    .signal
                    .evidence_f64("average_trade_volume")
                    .ok_or("missing evidence 'average_trade_volume'")?;
                for trade in fresh {
                    // defended side: below the level for longs, above for shorts
                    if (level - trade.price) * sign > rule.break_distance {
                        return Ok(Verdict::Invalidated(format!(
                            "level {} broken at {}",
                            level, trade.price
                        )));
                    }
                    if (trade.price - level).abs() <= rule.level_tolerance
                        && trade.volume as f64 >= average * rule.volume_factor
                    {
                        *tests += 1;
                    }
                }
                Ok(if *tests >= rule.min_tests { Verdict::Confirmed } else { Verdict::Pending })
            }
            Progress::Divergence { ref mut holding_ticks } => {
                let rule = &rules.divergence;
                let Some(price) = snapshot.last_price() else {
                    return Ok(Verdict::Pending);
                };
                if (original - price) * sign > original * rule.invalidation_pct {
                    return Ok(Verdict::Invalidated(format!("price moved against to {}", price)));
                }
                let holds = if sign >= 0.0 {
                    price >= original * rule.long_hold_ratio
                } else {
                    price <= original * rule.short_hold_ratio
                };
                if holds {
                    *holding_ticks += 1;
                }
                Ok(if *holding_ticks >= rule.hold_ticks { Verdict::Confirmed } else { Verdict::Pending })
            }
            Progress::Momentum { ref mut signed_volume } => {
                let rule = &rules.momentum;
                *signed_volume += fresh.iter().map(|t| t.signed_volume()).sum::<i64>();
                let along = *signed_volume as f64 * sign;
                if along >= rule.confirm_volume as f64 {
                    Ok(Verdict::Confirmed)
                } else if along <= -(rule.invalidate_volume as f64) {
                    Ok(Verdict::Invalidated(format!("signed volume {} against", signed_volume)))
                } else {
                    Ok(Verdict::Pending)
                }
            }
            Progress::Institutional => {
                let rule = &rules.institutional;
                if now - self.admitted_at < Duration::seconds(rule.min_elapsed_secs as i64) {
                    return Ok(Verdict::Pending);
                }
                let range_min = self.evidence("range_min")? as i64;
                let range_max = self.evidence("range_max")? as i64;
                let (total, institutional) = snapshot
                    .recent_trades(rule.lookback_trades)
                    .fold((0i64, 0i64), |(total, inst), t| {
                        let in_range = (range_min..=range_max).contains(&t.volume);
                        (total + t.volume, inst + if in_range { t.volume } else { 0 })
                    });
                if total > 0 && institutional as f64 / total as f64 >= rule.min_share {
                    Ok(Verdict::Confirmed)
                } else {
                    Ok(Verdict::Pending)
                }
            }
            Progress::HiddenLiquidity { ref mut reload_ticks } => {
                let rule = &rules.hidden_liquidity;
                let level = self.signal.evidence_f64("level").ok_or("missing evidence 'level'")?;
                let tolerance = self.signal.evidence_f64("level_tolerance").unwrap_or(0.0);
                let traded = fresh.iter().any(|t| (t.price - level).abs() <= tolerance);
                let shown = snapshot
                    .latest_book()
                    .map_or(0, |b| b.visible_volume_near(level, tolerance));
                if traded && shown > 0 {
                    *reload_ticks += 1;
                }
                Ok(if *reload_ticks >= rule.reload_ticks { Verdict::Confirmed } else { Verdict::Pending })
            }
        }
    }
}

/// A pending entry that reached a terminal state
#[derive(Debug, Clone)]
pub struct Resolution {
    pub signal: PatternSignal,
    pub outcome: ConfirmationOutcome,
    pub resolved_at: DateTime<Utc>,
    pub checks: u32,
}

impl Resolution {
    pub fn state(&self) -> PendingState {
        match self.outcome {
            ConfirmationOutcome::Confirmed => PendingState::Confirmed,
            ConfirmationOutcome::Expired => PendingState::Expired,
            ConfirmationOutcome::Invalidated { .. } => PendingState::Invalidated,
        }
    }

    pub fn to_event(&self) -> ObservabilityEvent {
        ObservabilityEvent::ConfirmationResolved {
            timestamp: self.resolved_at,
            signal_id: self.signal.id,
            pattern: self.signal.pattern,
            instrument: self.signal.instrument,
            outcome: self.outcome.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackerStats {
    pub pending: usize,
    pub admitted: u64,
    pub rejected: u64,
    pub confirmed: u64,
    pub expired: u64,
    pub invalidated: u64,
}

pub struct ConfirmationTracker {
    config: ConfirmationConfig,
    pending: HashMap<PendingKey, PendingConfirmation>,
    deadlines: BTreeMap<(DateTime<Utc>, Uuid), PendingKey>,
    stats: TrackerStats,
}

impl ConfirmationTracker {
    pub fn new(config: ConfirmationConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
            deadlines: BTreeMap::new(),
            stats: TrackerStats::default(),
        }
    }

    pub fn is_confirmable(&self, pattern: PatternType) -> bool {
        self.config.is_confirmable(pattern)
    }

    pub fn is_pending(&self, pattern: PatternType, instrument: Instrument) -> bool {
        self.pending.contains_key(&(pattern, instrument))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Admit a candidate as pending, returning its deadline
    pub fn admit(&mut self, signal: PatternSignal, now: DateTime<Utc>) -> Result<DateTime<Utc>, PendingRejection> {
        let rejection = match (self.config.timeout_secs(signal.pattern), Progress::for_pattern(signal.pattern)) {
            (Some(timeout), Some(progress)) => {
                let key = (signal.pattern, signal.instrument);
                if self.pending.contains_key(&key) {
                    PendingRejection::AlreadyPending(signal.pattern, signal.instrument)
                } else if self.pending.len() >= self.config.max_pending {
                    PendingRejection::CapacityReached(self.config.max_pending)
                } else {
                    let deadline = now + Duration::seconds(timeout as i64);
                    debug!(
                        pattern = %signal.pattern,
                        instrument = %signal.instrument,
                        deadline = %deadline,
                        "Candidate pending confirmation"
                    );
                    self.deadlines.insert((deadline, signal.id), key);
                    self.pending.insert(
                        key,
                        PendingConfirmation {
                            consumed_trades: None,
                            signal,
                            admitted_at: now,
                            deadline,
                            checks: 0,
                            progress,
                        },
                    );
                    self.stats.admitted += 1;
                    return Ok(deadline);
                }
            }
            _ => PendingRejection::NotConfirmable(signal.pattern),
        };
        self.stats.rejected += 1;
        debug!(pattern = %signal.pattern, instrument = %signal.instrument, "Pending rejected: {}", rejection);
        Err(rejection)
    }

    /// Sweep deadlines, then evaluate every remaining entry against `market`
    pub fn check(&mut self, market: &MarketSnapshot, now: DateTime<Utc>) -> Vec<Resolution> {
        let mut resolved = Vec::new();

        let expired: Vec<_> = self
            .deadlines
            .range(..=(now, Uuid::from_u128(u128::MAX)))
            .map(|(index, key)| (*index, *key))
            .collect();
        for (index, key) in expired {
            self.deadlines.remove(&index);
            if let Some(entry) = self.pending.remove(&key) {
                resolved.push(self.resolve(entry, ConfirmationOutcome::Expired, now));
            }
        }

        let order: Vec<_> = self.deadlines.iter().map(|(index, key)| (*index, *key)).collect();
        for (index, key) in order {
            let Some(entry) = self.pending.get_mut(&key) else {
                continue;
            };
            let outcome = match entry.evaluate(&self.config, market.instrument(key.1), now) {
                Verdict::Pending => continue,
                Verdict::Confirmed => ConfirmationOutcome::Confirmed,
                Verdict::Invalidated(reason) => ConfirmationOutcome::Invalidated { reason },
            };
            self.deadlines.remove(&index);
            if let Some(entry) = self.pending.remove(&key) {
                resolved.push(self.resolve(entry, outcome, now));
            }
        }
        resolved
    }

    fn resolve(&mut self, entry: PendingConfirmation, outcome: ConfirmationOutcome, now: DateTime<Utc>) -> Resolution {
        let mut signal = entry.signal;
        match outcome {
            ConfirmationOutcome::Confirmed => {
                signal.confirmed = true;
                self.stats.confirmed += 1;
            }
            ConfirmationOutcome::Expired => self.stats.expired += 1,
            ConfirmationOutcome::Invalidated { .. } => self.stats.invalidated += 1,
        }
        info!(
            pattern = %signal.pattern,
            instrument = %signal.instrument,
            outcome = %outcome,
            checks = entry.checks,
            "Pending confirmation resolved"
        );
        Resolution {
            signal,
            outcome,
            resolved_at: now,
            checks: entry.checks,
        }
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            pending: self.pending.len(),
            ..self.stats.clone()
        }
    }
}
