//! Realized outcome tracking and gate statistics

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::risk::{RiskLevel, WindowCounts};

/// Daily performance figures fed by realized outcomes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeMetrics {
    pub consecutive_losses: u32,
    pub daily_pnl: Decimal,
    /// Highest daily PnL reached today
    pub peak_pnl: Decimal,
    pub wins: u32,
    pub losses: u32,
    pub last_outcome_at: Option<DateTime<Utc>>,
}

impl OutcomeMetrics {
    pub fn empty() -> Self {
        Self {
            consecutive_losses: 0,
            daily_pnl: Decimal::ZERO,
            peak_pnl: Decimal::ZERO,
            wins: 0,
            losses: 0,
            last_outcome_at: None,
        }
    }

    /// Fold one realized result into the daily figures
    pub fn record(&mut self, pnl: Decimal, now: DateTime<Utc>) {
        self.daily_pnl += pnl;
        if self.daily_pnl > self.peak_pnl {
            self.peak_pnl = self.daily_pnl;
        }

        if pnl < Decimal::ZERO {
            self.losses += 1;
            self.consecutive_losses += 1;
        } else {
            // breakeven counts as a win for the loss streak
            self.wins += 1;
            self.consecutive_losses = 0;
        }
        self.last_outcome_at = Some(now);
    }

    /// Drawdown from the day's peak, in percent of the peak
    pub fn drawdown_percent(&self) -> f64 {
        if self.peak_pnl <= Decimal::ZERO {
            return 0.0;
        }
        let drawdown = (self.peak_pnl - self.daily_pnl) / self.peak_pnl * Decimal::ONE_HUNDRED;
        drawdown.to_f64().unwrap_or(0.0)
    }

    pub fn win_rate(&self) -> Option<f64> {
        let total = self.wins + self.losses;
        if total == 0 {
            None
        } else {
            Some(self.wins as f64 / total as f64)
        }
    }
}

impl Default for OutcomeMetrics {
    fn default() -> Self {
        Self::empty()
    }
}

/// Gate statistics for reporting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskStats {
    pub evaluated: u64,
    pub approved: u64,
    pub rejected: u64,
    /// Rejections keyed by violation kind
    pub rejections: BTreeMap<String, u64>,
    pub breaker_trips: u64,
    pub windows: WindowCounts,
    pub outcomes: OutcomeMetrics,
    pub open_breakers: Vec<String>,
    pub risk_level: Option<RiskLevel>,
}

impl RiskStats {
    pub fn approval_rate(&self) -> f64 {
        if self.evaluated == 0 {
            0.0
        } else {
            self.approved as f64 / self.evaluated as f64
        }
    }
}
