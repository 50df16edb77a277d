//! # Comparator Module
//!
//! Hamming distance between fingerprints and similarity tiers.
//!
//! ## Tiers
//! | Differing bits / total bits | Tier      |
//! |-----------------------------|-----------|
//! | 0                           | Exact     |
//! | <= 10%                      | High      |
//! | <= 25%                      | Medium    |
//! | > 25%                       | Unrelated |
//!
//! The ratios are configurable through [`SimilarityThresholds`]; the values
//! above are the defaults.

mod thresholds;

pub use thresholds::SimilarityThresholds;

use crate::core::fingerprint::Fingerprint;
use crate::error::CompareError;
use serde::{Deserialize, Serialize};

/// Default maximum Hamming distance for near-duplicate grouping
pub const DEFAULT_MAX_DISTANCE: u32 = 10;

/// Similarity classification of a pair of fingerprints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityTier {
    Exact,
    High,
    Medium,
    Unrelated,
}

impl SimilarityTier {
    /// Tiers that make a pair a near-duplicate candidate
    pub fn is_near(&self) -> bool {
        matches!(self, SimilarityTier::High | SimilarityTier::Medium)
    }
}

impl std::fmt::Display for SimilarityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimilarityTier::Exact => write!(f, "exact"),
            SimilarityTier::High => write!(f, "high"),
            SimilarityTier::Medium => write!(f, "medium"),
            SimilarityTier::Unrelated => write!(f, "unrelated"),
        }
    }
}

/// Count of differing bits between two equal-length fingerprints
pub fn hamming_distance(a: &Fingerprint, b: &Fingerprint) -> Result<u32, CompareError> {
    if a.len() != b.len() {
        return Err(CompareError::LengthMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    Ok(a.nibbles()
        .zip(b.nibbles())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum())
}

/// Normalised similarity in `[0, 1]` derived from a distance.
///
/// This is the only source of a pair's similarity score.
pub fn similarity_score(distance: u32, total_bits: u32) -> f64 {
    if total_bits == 0 {
        return if distance == 0 { 1.0 } else { 0.0 };
    }
    (1.0 - f64::from(distance) / f64::from(total_bits)).clamp(0.0, 1.0)
}

/// Outcome of comparing two fingerprints
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub distance: u32,
    pub total_bits: u32,
    pub tier: SimilarityTier,
    pub score: f64,
}

/// Compares fingerprints using configured thresholds
#[derive(Debug, Clone, Copy)]
pub struct HashComparator {
    thresholds: SimilarityThresholds,
    max_distance: u32,
}

impl HashComparator {
    pub fn new(thresholds: SimilarityThresholds, max_distance: u32) -> Self {
        Self {
            thresholds,
            max_distance,
        }
    }

    pub fn thresholds(&self) -> &SimilarityThresholds {
        &self.thresholds
    }

    pub fn max_distance(&self) -> u32 {
        self.max_distance
    }

    /// Distance, tier and score of a pair
    pub fn compare(&self, a: &Fingerprint, b: &Fingerprint) -> Result<Comparison, CompareError> {
        let distance = hamming_distance(a, b)?;
        let total_bits = a.bit_len();
        Ok(Comparison {
            distance,
            total_bits,
            tier: self.thresholds.classify(distance, total_bits),
            score: similarity_score(distance, total_bits),
        })
    }

    /// Whether a comparison qualifies for near-duplicate grouping
    pub fn is_near_duplicate(&self, comparison: &Comparison) -> bool {
        comparison.tier.is_near() && comparison.distance <= self.max_distance
    }
}

impl Default for HashComparator {
    fn default() -> Self {
        Self::new(SimilarityThresholds::default(), DEFAULT_MAX_DISTANCE)
    }
}
