//! Configurable tier boundaries.

use super::SimilarityTier;
use crate::error::CompareError;
use serde::{Deserialize, Serialize};

/// Ratio boundaries between similarity tiers.
///
/// A pair is `High` when `distance / total_bits <= high_ratio` and `Medium`
/// when it is `<= medium_ratio`. Zero distance is always `Exact`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityThresholds {
    pub high_ratio: f64,
    pub medium_ratio: f64,
}

impl SimilarityThresholds {
    /// Create validated thresholds (`0 <= high <= medium <= 1`)
    pub fn new(high_ratio: f64, medium_ratio: f64) -> Result<Self, CompareError> {
        let thresholds = Self {
            high_ratio,
            medium_ratio,
        };
        thresholds.validate()?;
        Ok(thresholds)
    }

    pub fn validate(&self) -> Result<(), CompareError> {
        let in_range = |r: f64| (0.0..=1.0).contains(&r);
        if !in_range(self.high_ratio) || !in_range(self.medium_ratio) {
            return Err(CompareError::InvalidThreshold(format!(
                "ratios must be within 0..=1, got high={} medium={}",
                self.high_ratio, self.medium_ratio
            )));
        }
        if self.high_ratio > self.medium_ratio {
            return Err(CompareError::InvalidThreshold(format!(
                "high ratio {} exceeds medium ratio {}",
                self.high_ratio, self.medium_ratio
            )));
        }
        Ok(())
    }

    /// Classify a distance out of `total_bits`
    pub fn classify(&self, distance: u32, total_bits: u32) -> SimilarityTier {
        if distance == 0 {
            return SimilarityTier::Exact;
        }
        if total_bits == 0 {
            return SimilarityTier::Unrelated;
        }

        let ratio = f64::from(distance) / f64::from(total_bits);
        if ratio <= self.high_ratio {
            SimilarityTier::High
        } else if ratio <= self.medium_ratio {
            SimilarityTier::Medium
        } else {
            SimilarityTier::Unrelated
        }
    }
}

impl Default for SimilarityThresholds {
    fn default() -> Self {
        Self {
            high_ratio: 0.10,
            medium_ratio: 0.25,
        }
    }
}
