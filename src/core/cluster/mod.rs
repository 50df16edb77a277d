//! # Cluster Module
//!
//! Groups `(id, fingerprint)` pairs into exact and near-duplicate clusters.
//!
//! ## How It Works
//! 1. Bucket items by exact fingerprint; every bucket with more than one
//!    member is an exact group and leaves the near search entirely
//! 2. Walk the remaining items in input order. Each unprocessed item seeds a
//!    group with every later unprocessed item whose comparison is `High` or
//!    `Medium` and within `max_distance`
//! 3. Grouped items are marked processed, so an item belongs to at most one
//!    group
//!
//! ## Output Order
//! Exact groups before near groups, then descending member count, then
//! ascending minimum distance. Ties keep discovery order, so the same input
//! always yields the same list.

mod index;
pub mod rpc;

pub use index::SegmentIndex;

use crate::core::comparator::{HashComparator, SimilarityTier};
use crate::core::fingerprint::Fingerprint;
use crate::core::media::MediaCategory;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// Item count from which the segment index replaces the full scan
pub const DEFAULT_INDEX_MIN_ITEMS: usize = 512;

/// How a cluster's members relate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterKind {
    Exact,
    Near,
}

/// A set of items sharing a fingerprint or close to a common seed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCluster<Id> {
    /// The shared fingerprint, or `similar_<seed fingerprint>`
    pub key: String,
    pub kind: ClusterKind,
    /// Members in input order; for near groups the seed comes first
    pub members: Vec<Id>,
    pub min_distance: u32,
    pub max_distance: u32,
    /// Tier of the loosest member
    pub tier: SimilarityTier,
}

impl<Id> DuplicateCluster<Id> {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Clustering output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterResult<Id> {
    pub exact_groups: Vec<DuplicateCluster<Id>>,
    pub near_groups: Vec<DuplicateCluster<Id>>,
    /// Pairs of near-search candidates never compared because their
    /// fingerprints have different lengths. Exact-group members are not
    /// counted. The value does not depend on whether the index was used.
    pub skipped_comparisons: usize,
}

impl<Id> ClusterResult<Id> {
    fn empty() -> Self {
        Self {
            exact_groups: Vec::new(),
            near_groups: Vec::new(),
            skipped_comparisons: 0,
        }
    }

    /// All groups in output order
    pub fn sorted_groups(&self) -> Vec<&DuplicateCluster<Id>> {
        self.exact_groups.iter().chain(&self.near_groups).collect()
    }

    pub fn group_count(&self) -> usize {
        self.exact_groups.len() + self.near_groups.len()
    }

    fn sort(&mut self) {
        sort_groups(&mut self.exact_groups);
        sort_groups(&mut self.near_groups);
    }
}

fn sort_groups<Id>(groups: &mut [DuplicateCluster<Id>]) {
    // Stable, so ties keep discovery order
    groups.sort_by(|a, b| {
        a.kind
            .cmp(&b.kind)
            .then(b.members.len().cmp(&a.members.len()))
            .then(a.min_distance.cmp(&b.min_distance))
    });
}

/// Exact and near-duplicate clustering
#[derive(Debug, Clone, Copy)]
pub struct DuplicateClusterer {
    comparator: HashComparator,
    index_min_items: usize,
}

impl DuplicateClusterer {
    pub fn new(comparator: HashComparator) -> Self {
        Self {
            comparator,
            index_min_items: DEFAULT_INDEX_MIN_ITEMS,
        }
    }

    /// Use the segment index once at least `min_items` items remain after the
    /// exact pass. `usize::MAX` disables it.
    pub fn with_index_min_items(mut self, min_items: usize) -> Self {
        self.index_min_items = min_items;
        self
    }

    pub fn comparator(&self) -> &HashComparator {
        &self.comparator
    }

    /// Cluster one candidate set
    pub fn cluster<Id>(&self, items: &[(Id, Fingerprint)]) -> ClusterResult<Id>
    where
        Id: Clone + Eq + Hash,
    {
        // First occurrence of an id wins
        let mut seen = HashSet::new();
        let items: Vec<&(Id, Fingerprint)> =
            items.iter().filter(|(id, _)| seen.insert(id)).collect();

        let mut result = ClusterResult::empty();

        let mut bucket_of: HashMap<&Fingerprint, usize> = HashMap::new();
        let mut buckets: Vec<(&Fingerprint, Vec<usize>)> = Vec::new();
        for (position, (_, fingerprint)) in items.iter().enumerate() {
            match bucket_of.get(fingerprint) {
                Some(&bucket) => buckets[bucket].1.push(position),
                None => {
                    bucket_of.insert(fingerprint, buckets.len());
                    buckets.push((fingerprint, vec![position]));
                }
            }
        }

        let mut remaining = Vec::new();
        for (fingerprint, members) in &buckets {
            if members.len() > 1 {
                result.exact_groups.push(DuplicateCluster {
                    key: fingerprint.to_string(),
                    kind: ClusterKind::Exact,
                    members: members.iter().map(|&p| items[p].0.clone()).collect(),
                    min_distance: 0,
                    max_distance: 0,
                    tier: SimilarityTier::Exact,
                });
            } else {
                remaining.extend(members.iter().copied());
            }
        }
        remaining.sort_unstable();

        result.skipped_comparisons =
            cross_length_pairs(remaining.iter().map(|&p| items[p].1.len()));
        result.near_groups = self.near_groups(&items, &remaining);

        if result.skipped_comparisons > 0 {
            tracing::warn!(
                "Skipped {} comparisons between fingerprints of different lengths",
                result.skipped_comparisons
            );
        }

        result.sort();
        result
    }

    fn near_groups<Id: Clone>(
        &self,
        items: &[&(Id, Fingerprint)],
        remaining: &[usize],
    ) -> Vec<DuplicateCluster<Id>> {
        let fingerprints: Vec<&Fingerprint> = remaining.iter().map(|&p| &items[p].1).collect();
        let index = if remaining.len() >= self.index_min_items {
            SegmentIndex::build(fingerprints.clone(), self.comparator.max_distance())
        } else {
            None
        };
        if index.is_some() {
            tracing::debug!("Using segment index for {} candidates", remaining.len());
        }

        let mut processed = vec![false; remaining.len()];
        let mut groups = Vec::new();

        for seed in 0..remaining.len() {
            if processed[seed] {
                continue;
            }

            let candidates: Vec<usize> = match &index {
                Some(index) => index.candidates_after(seed),
                None => (seed + 1..remaining.len()).collect(),
            };

            let mut matches: Vec<(usize, u32)> = Vec::new();
            for candidate in candidates {
                if processed[candidate]
                    || fingerprints[candidate].len() != fingerprints[seed].len()
                {
                    continue;
                }
                match self
                    .comparator
                    .compare(fingerprints[seed], fingerprints[candidate])
                {
                    Ok(comparison) if self.comparator.is_near_duplicate(&comparison) => {
                        matches.push((candidate, comparison.distance));
                    }
                    Ok(_) => {}
                    Err(e) => tracing::debug!("Comparison failed, skipping pair: {}", e),
                }
            }

            if matches.is_empty() {
                continue;
            }

            processed[seed] = true;
            let mut members = vec![items[remaining[seed]].0.clone()];
            let mut min_distance = u32::MAX;
            let mut max_distance = 0;
            for (candidate, distance) in matches {
                processed[candidate] = true;
                members.push(items[remaining[candidate]].0.clone());
                min_distance = min_distance.min(distance);
                max_distance = max_distance.max(distance);
            }

            let total_bits = fingerprints[seed].bit_len();
            groups.push(DuplicateCluster {
                key: format!("similar_{}", fingerprints[seed]),
                kind: ClusterKind::Near,
                members,
                min_distance,
                max_distance,
                tier: self.comparator.thresholds().classify(max_distance, total_bits),
            });
        }

        groups
    }

    /// Cluster items per media category; items of different categories are
    /// never compared
    pub fn cluster_by_category<Id>(
        &self,
        items: &[(Id, MediaCategory, Fingerprint)],
    ) -> ClusterResult<Id>
    where
        Id: Clone + Eq + Hash,
    {
        let mut order: Vec<MediaCategory> = Vec::new();
        let mut partitions: HashMap<MediaCategory, Vec<(Id, Fingerprint)>> = HashMap::new();
        for (id, category, fingerprint) in items {
            if !partitions.contains_key(category) {
                order.push(*category);
            }
            partitions
                .entry(*category)
                .or_default()
                .push((id.clone(), fingerprint.clone()));
        }

        let mut merged = ClusterResult::empty();
        for category in order {
            if let Some(partition) = partitions.get(&category) {
                let result = self.cluster(partition);
                merged.exact_groups.extend(result.exact_groups);
                merged.near_groups.extend(result.near_groups);
                merged.skipped_comparisons += result.skipped_comparisons;
            }
        }
        merged.sort();
        merged
    }
}

impl Default for DuplicateClusterer {
    fn default() -> Self {
        Self::new(HashComparator::default())
    }
}

/// Unordered pairs whose lengths differ, from the multiset of lengths
fn cross_length_pairs(lengths: impl Iterator<Item = usize>) -> usize {
    let mut per_length: HashMap<usize, usize> = HashMap::new();
    let mut total: usize = 0;
    for length in lengths {
        *per_length.entry(length).or_default() += 1;
        total += 1;
    }
    let same_length: usize = per_length.values().map(|n| n * (n - 1) / 2).sum();
    total * total.saturating_sub(1) / 2 - same_length
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::comparator::SimilarityThresholds;

    fn fp(hex: &str) -> Fingerprint {
        Fingerprint::parse(hex).unwrap()
    }

    fn items(entries: &[(&'static str, &str)]) -> Vec<(&'static str, Fingerprint)> {
        entries.iter().map(|(id, hex)| (*id, fp(hex))).collect()
    }

    const BASE: &str = "0000000000000000";

    #[test]
    fn exact_members_leave_the_near_search() {
        let input = items(&[
            ("a", BASE),
            ("b", BASE),
            ("c", "0000000000000001"),
        ]);
        let result = DuplicateClusterer::default().cluster(&input);

        assert_eq!(result.exact_groups.len(), 1);
        assert_eq!(result.exact_groups[0].members, vec!["a", "b"]);
        assert_eq!(result.exact_groups[0].key, BASE);
        // "c" is close to a and b but they are already grouped
        assert!(result.near_groups.is_empty());
    }

    #[test]
    fn near_group_collects_items_close_to_seed() {
        let input = items(&[
            ("seed", BASE),
            ("one", "0000000000000001"),
            ("far", "ffffffffffffffff"),
            ("three", "0000000000000007"),
        ]);
        let result = DuplicateClusterer::default().cluster(&input);

        assert!(result.exact_groups.is_empty());
        assert_eq!(result.near_groups.len(), 1);
        let group = &result.near_groups[0];
        assert_eq!(group.members, vec!["seed", "one", "three"]);
        assert_eq!(group.key, format!("similar_{}", BASE));
        assert_eq!(group.min_distance, 1);
        assert_eq!(group.max_distance, 3);
        assert_eq!(group.tier, SimilarityTier::High);
    }

    #[test]
    fn max_distance_caps_near_membership() {
        let comparator = HashComparator::new(SimilarityThresholds::default(), 2);
        let input = items(&[("a", BASE), ("b", "0000000000000007")]);
        let result = DuplicateClusterer::new(comparator).cluster(&input);
        assert_eq!(result.group_count(), 0);
    }

    #[test]
    fn groups_follow_the_output_order() {
        let input = items(&[
            // near pair, distance 2
            ("n1", "1111111111111111"),
            ("n2", "1111111111111112"),
            // exact pair
            ("e1", "aaaaaaaaaaaaaaaa"),
            ("e2", "aaaaaaaaaaaaaaaa"),
            // near triple, distance 1
            ("t1", "4444444444444444"),
            ("t2", "4444444444444445"),
            ("t3", "4444444444444446"),
            // near pair, distance 1
            ("m1", "8888888888888888"),
            ("m2", "8888888888888889"),
            // exact triple
            ("x1", "cccccccccccccccc"),
            ("x2", "cccccccccccccccc"),
            ("x3", "cccccccccccccccc"),
        ]);
        let result = DuplicateClusterer::default().cluster(&input);
        let keys: Vec<&str> = result
            .sorted_groups()
            .iter()
            .map(|g| g.members[0])
            .collect();

        assert_eq!(keys, vec!["x1", "e1", "t1", "m1", "n1"]);
    }

    #[test]
    fn no_item_appears_in_two_groups() {
        let input = items(&[
            ("a", BASE),
            ("b", "0000000000000001"),
            ("c", "0000000000000003"),
            ("d", "0000000000000007"),
            ("e", "000000000000000f"),
            ("f", "00000000000000ff"),
            ("g", BASE),
            ("a", "ffffffffffffffff"),
        ]);
        let result = DuplicateClusterer::default().cluster(&input);

        let mut seen = HashSet::new();
        for group in result.sorted_groups() {
            for member in &group.members {
                assert!(seen.insert(*member), "{} grouped twice", member);
            }
        }
    }

    #[test]
    fn clustering_is_idempotent() {
        let input = items(&[
            ("a", "0f0f0f0f0f0f0f0f"),
            ("b", "0f0f0f0f0f0f0f0e"),
            ("c", "f0f0f0f0f0f0f0f0"),
            ("d", "f0f0f0f0f0f0f0f0"),
            ("e", "0f0f0f0f0f0f0f0c"),
        ]);
        let clusterer = DuplicateClusterer::default();
        assert_eq!(clusterer.cluster(&input), clusterer.cluster(&input));
    }

    #[test]
    fn mismatched_lengths_are_skipped_not_fatal() {
        let input = items(&[
            ("short", "0000"),
            ("long", BASE),
            ("near", "0000000000000001"),
        ]);
        let result = DuplicateClusterer::default().cluster(&input);

        assert_eq!(result.skipped_comparisons, 2);
        assert_eq!(result.near_groups.len(), 1);
        assert_eq!(result.near_groups[0].members, vec!["long", "near"]);
    }

    #[test]
    fn skipped_count_is_the_same_with_and_without_index() {
        let input = items(&[
            ("a", "0000"),
            ("b", "0001"),
            ("c", BASE),
            ("d", "0000000000000001"),
            ("e", "ffff"),
            ("f", "ffffffffffffffff"),
        ]);
        // a small distance keeps even the short fingerprints indexable
        let clusterer =
            || DuplicateClusterer::new(HashComparator::new(SimilarityThresholds::default(), 2));
        let full = clusterer().with_index_min_items(usize::MAX).cluster(&input);
        let indexed = clusterer().with_index_min_items(0).cluster(&input);

        // three short and three long fingerprints
        assert_eq!(full.skipped_comparisons, 9);
        assert_eq!(indexed.skipped_comparisons, full.skipped_comparisons);
        assert_eq!(indexed.near_groups, full.near_groups);
    }

    #[test]
    fn index_does_not_change_the_output() {
        let mut input = Vec::new();
        for i in 0..200u32 {
            // Families of near-identical fingerprints plus unrelated noise
            let family = format!("{:016x}", u64::from(i / 4) * 0x0101_0101_0101_0101);
            let mut hex: Vec<char> = family.chars().collect();
            let last = hex[15].to_digit(16).unwrap() ^ (i % 4);
            hex[15] = std::char::from_digit(last, 16).unwrap();
            input.push((i, fp(&hex.into_iter().collect::<String>())));
        }

        let full = DuplicateClusterer::default()
            .with_index_min_items(usize::MAX)
            .cluster(&input);
        let indexed = DuplicateClusterer::default()
            .with_index_min_items(0)
            .cluster(&input);

        assert!(full.group_count() > 0);
        assert_eq!(full.exact_groups, indexed.exact_groups);
        assert_eq!(full.near_groups, indexed.near_groups);
    }

    #[test]
    fn categories_are_clustered_separately() {
        let input = vec![
            ("img", MediaCategory::Image, fp(BASE)),
            ("raw", MediaCategory::Raw, fp(BASE)),
            ("img2", MediaCategory::Image, fp(BASE)),
        ];
        let result = DuplicateClusterer::default().cluster_by_category(&input);

        assert_eq!(result.exact_groups.len(), 1);
        assert_eq!(result.exact_groups[0].members, vec!["img", "img2"]);
    }
}
