//! # Segment Index
//!
//! Candidate pre-filter for near-duplicate search.
//!
//! ## How It Works
//! 1. Split every fingerprint into `max_distance + 1` contiguous hex segments
//! 2. Index items by (segment number, segment text)
//! 3. Two fingerprints within `max_distance` bits differ in at most
//!    `max_distance` segments, so by pigeonhole they share at least one
//!    segment verbatim
//!
//! Only items sharing a segment are compared, which turns the quadratic scan
//! into roughly linear work on realistic libraries. Recall is exact: every
//! pair the full scan would accept is still a candidate.

use crate::core::fingerprint::Fingerprint;
use std::collections::HashMap;

/// Segment index over a slice of fingerprints
pub struct SegmentIndex<'a> {
    segments: usize,
    tables: Vec<HashMap<&'a str, Vec<usize>>>,
    fingerprints: Vec<&'a Fingerprint>,
}

impl<'a> SegmentIndex<'a> {
    /// Build an index for `max_distance`.
    ///
    /// Returns `None` when the fingerprints are too short to be split into
    /// enough segments for the pigeonhole guarantee.
    pub fn build(fingerprints: Vec<&'a Fingerprint>, max_distance: u32) -> Option<Self> {
        let segments = max_distance as usize + 1;
        let shortest = fingerprints.iter().map(|f| f.len()).min()?;
        if shortest < segments {
            return None;
        }

        let mut tables: Vec<HashMap<&'a str, Vec<usize>>> =
            (0..segments).map(|_| HashMap::new()).collect();

        for (position, fingerprint) in fingerprints.iter().enumerate() {
            for (segment, text) in split(fingerprint.as_str(), segments).into_iter().enumerate() {
                tables[segment].entry(text).or_default().push(position);
            }
        }

        Some(Self {
            segments,
            tables,
            fingerprints,
        })
    }

    /// Positions after `position` that share at least one segment with it,
    /// ascending
    pub fn candidates_after(&self, position: usize) -> Vec<usize> {
        let Some(fingerprint) = self.fingerprints.get(position) else {
            return Vec::new();
        };

        let mut found: Vec<usize> = split(fingerprint.as_str(), self.segments)
            .into_iter()
            .enumerate()
            .filter_map(|(segment, text)| self.tables[segment].get(text))
            .flatten()
            .copied()
            .filter(|&other| other > position)
            .collect();
        found.sort_unstable();
        found.dedup();
        found
    }
}

/// Split `hex` into `segments` contiguous, nearly equal, non-empty slices
fn split(hex: &str, segments: usize) -> Vec<&str> {
    let len = hex.len();
    (0..segments)
        .map(|i| &hex[i * len / segments..(i + 1) * len / segments])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(hex: &str) -> Fingerprint {
        Fingerprint::parse(hex).unwrap()
    }

    #[test]
    fn split_covers_the_whole_string() {
        assert_eq!(split("abcdefgh", 3), vec!["ab", "cde", "fgh"]);
        assert_eq!(split("abcd", 4), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn near_pairs_are_always_candidates() {
        // Two bits apart, in different digits
        let fingerprints = [fp("0000000000000000"), fp("ffffffffffffffff"), fp("1000000000000001")];
        let index = SegmentIndex::build(fingerprints.iter().collect(), 2).unwrap();

        assert_eq!(index.candidates_after(0), vec![2]);
        assert!(index.candidates_after(1).is_empty());
    }

    #[test]
    fn too_short_fingerprints_disable_the_index() {
        let fingerprints = [fp("ab"), fp("cd")];
        assert!(SegmentIndex::build(fingerprints.iter().collect(), 10).is_none());
    }
}
