// Pattern signal model
// Candidates produced by detectors and carried through confirmation and risk

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::market::Instrument;

/// Closed set of pattern types the detector bank can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Absorption,
    Iceberg,
    Divergence,
    MomentumExtreme,
    Pressure,
    VolumeSpike,
    PaceAnomaly,
    BookPulling,
    BookStacking,
    FlashOrder,
    ImbalanceShift,
    InstitutionalFootprint,
    HiddenLiquidity,
    MultiframeDivergence,
    MultiframeConfluence,
    Trap,
    CalculatedDivergence,
    CalculatedConfluence,
}

impl PatternType {
    pub const ALL: [PatternType; 18] = [
        PatternType::Absorption,
        PatternType::Iceberg,
        PatternType::Divergence,
        PatternType::MomentumExtreme,
        PatternType::Pressure,
        PatternType::VolumeSpike,
        PatternType::PaceAnomaly,
        PatternType::BookPulling,
        PatternType::BookStacking,
        PatternType::FlashOrder,
        PatternType::ImbalanceShift,
        PatternType::InstitutionalFootprint,
        PatternType::HiddenLiquidity,
        PatternType::MultiframeDivergence,
        PatternType::MultiframeConfluence,
        PatternType::Trap,
        PatternType::CalculatedDivergence,
        PatternType::CalculatedConfluence,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PatternType::Absorption => "absorption",
            PatternType::Iceberg => "iceberg",
            PatternType::Divergence => "divergence",
            PatternType::MomentumExtreme => "momentum_extreme",
            PatternType::Pressure => "pressure",
            PatternType::VolumeSpike => "volume_spike",
            PatternType::PaceAnomaly => "pace_anomaly",
            PatternType::BookPulling => "book_pulling",
            PatternType::BookStacking => "book_stacking",
            PatternType::FlashOrder => "flash_order",
            PatternType::ImbalanceShift => "imbalance_shift",
            PatternType::InstitutionalFootprint => "institutional_footprint",
            PatternType::HiddenLiquidity => "hidden_liquidity",
            PatternType::MultiframeDivergence => "multiframe_divergence",
            PatternType::MultiframeConfluence => "multiframe_confluence",
            PatternType::Trap => "trap",
            PatternType::CalculatedDivergence => "calculated_divergence",
            PatternType::CalculatedConfluence => "calculated_confluence",
        }
    }

    /// Where the evidence for this pattern comes from
    pub fn source(self) -> SignalSource {
        match self {
            PatternType::BookPulling
            | PatternType::BookStacking
            | PatternType::FlashOrder
            | PatternType::ImbalanceShift => SignalSource::BookDynamics,
            PatternType::CalculatedDivergence | PatternType::CalculatedConfluence => {
                SignalSource::CalculatedMarket
            }
            _ => SignalSource::TapeReading,
        }
    }

    /// Confluence-type patterns share their own hourly admission cap
    pub fn is_confluence(self) -> bool {
        matches!(
            self,
            PatternType::MultiframeConfluence
                | PatternType::CalculatedConfluence
                | PatternType::CalculatedDivergence
        )
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Origin of a signal's evidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    TapeReading,
    BookDynamics,
    CalculatedMarket,
}

/// Signal direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalDirection {
    Long,
    Short,
    Neutral,
}

impl SignalDirection {
    /// Direction of a signed quantity, neutral at zero
    pub fn from_signed(value: f64) -> Self {
        if value > 0.0 {
            SignalDirection::Long
        } else if value < 0.0 {
            SignalDirection::Short
        } else {
            SignalDirection::Neutral
        }
    }

    pub fn sign(self) -> f64 {
        match self {
            SignalDirection::Long => 1.0,
            SignalDirection::Short => -1.0,
            SignalDirection::Neutral => 0.0,
        }
    }
}

/// Candidate or accepted trading signal
///
/// `strength` and `confidence` are kept inside [0, 1]; every mutation goes
/// through a clamping setter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSignal {
    pub id: Uuid,
    pub pattern: PatternType,
    pub source: SignalSource,
    pub instrument: Instrument,
    pub direction: SignalDirection,
    strength: f64,
    confidence: f64,
    /// Reference price at detection
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    /// Detector-specific supporting evidence
    pub evidence: serde_json::Value,
    pub annotations: Vec<String>,
    pub confirmed: bool,
}

impl PatternSignal {
    pub fn new(
        pattern: PatternType,
        instrument: Instrument,
        direction: SignalDirection,
        price: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            pattern,
            source: pattern.source(),
            instrument,
            direction,
            strength: 0.5,
            confidence: 0.5,
            price,
            timestamp,
            evidence: serde_json::Value::Object(serde_json::Map::new()),
            annotations: Vec::new(),
            confirmed: false,
        }
    }

    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = clamp_unit(strength);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = clamp_unit(confidence);
        self
    }

    pub fn with_evidence(mut self, evidence: serde_json::Value) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn strength(&self) -> f64 {
        self.strength
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Multiply confidence by `1 - penalty`
    pub fn penalize(&mut self, penalty: f64) {
        self.scale_confidence(1.0 - clamp_unit(penalty));
    }

    pub fn scale_confidence(&mut self, factor: f64) {
        self.confidence = clamp_unit(self.confidence * factor);
    }

    pub fn annotate(&mut self, note: impl Into<String>) {
        self.annotations.push(note.into());
    }

    pub fn evidence_f64(&self, key: &str) -> Option<f64> {
        self.evidence.get(key).and_then(|v| v.as_f64())
    }

    /// Number of populated evidence fields
    pub fn evidence_richness(&self) -> usize {
        match &self.evidence {
            serde_json::Value::Object(map) => map.values().filter(|v| !v.is_null()).count(),
            serde_json::Value::Null => 0,
            _ => 1,
        }
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
