//! Signal quality scoring

use crate::config::QualityConfig;
use common::{PatternSignal, PatternType, SignalSource};
use serde::{Deserialize, Serialize};

/// Evidence fields at which richness saturates
const FULL_EVIDENCE_FIELDS: f64 = 6.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QualityRating {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl QualityRating {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s >= 0.7 => QualityRating::Excellent,
            s if s >= 0.5 => QualityRating::Good,
            s if s >= 0.35 => QualityRating::Fair,
            _ => QualityRating::Poor,
        }
    }
}

/// Per-component scores, each in [0, 1] before weighting
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityComponents {
    pub source: f64,
    pub level: f64,
    pub evidence: f64,
    pub pattern: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub score: f64,
    pub rating: QualityRating,
    pub components: QualityComponents,
}

#[derive(Debug, Clone)]
pub struct QualityScorer {
    config: QualityConfig,
}

impl QualityScorer {
    pub fn new(config: QualityConfig) -> Self {
        Self { config }
    }

    /// Weighted mean of the components, scaled by the signal's confidence
    pub fn assess(&self, signal: &PatternSignal) -> QualityAssessment {
        let components = QualityComponents {
            source: source_reliability(signal),
            level: strength_tier(signal.strength()),
            evidence: (signal.evidence_richness() as f64 / FULL_EVIDENCE_FIELDS).min(1.0),
            pattern: pattern_tier(signal.pattern),
        };

        let weights = [
            self.config.source_weight,
            self.config.level_weight,
            self.config.evidence_weight,
            self.config.pattern_weight,
        ];
        let values = [
            components.source,
            components.level,
            components.evidence,
            components.pattern,
        ];
        let total_weight: f64 = weights.iter().sum();
        let weighted: f64 = weights.iter().zip(values.iter()).map(|(w, v)| w * v).sum();

        let score = if total_weight > 0.0 {
            (weighted / total_weight * signal.confidence()).clamp(0.0, 1.0)
        } else {
            0.0
        };

        QualityAssessment {
            score,
            rating: QualityRating::from_score(score),
            components,
        }
    }
}

fn source_reliability(signal: &PatternSignal) -> f64 {
    if signal.pattern.is_confluence() {
        return 1.0;
    }
    match signal.source {
        SignalSource::CalculatedMarket => 0.8,
        SignalSource::TapeReading => 0.6,
        SignalSource::BookDynamics => 0.45,
    }
}

fn strength_tier(strength: f64) -> f64 {
    if strength >= 0.8 {
        1.0
    } else if strength >= 0.5 {
        0.6
    } else {
        0.2
    }
}

fn pattern_tier(pattern: PatternType) -> f64 {
    match pattern {
        PatternType::Absorption
        | PatternType::Divergence
        | PatternType::Iceberg
        | PatternType::MomentumExtreme => 1.0,
        PatternType::Pressure | PatternType::VolumeSpike => 0.7,
        _ => 0.3,
    }
}
