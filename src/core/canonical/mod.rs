//! # Canonical Module
//!
//! Decides which copy of a duplicate pair to keep.
//!
//! ## Identical Pairs
//! Two items count as identical when size, extension, pixel dimensions match
//! and the fingerprints are equal (distance 0, score 1.0). The keeper is then
//! picked by the first rule that separates them:
//!
//! 1. A name that is not auto-renamed (`f<digits>.<ext>`) beats one that is
//! 2. The earlier EXIF capture time, when both have one
//! 3. The larger file
//! 4. Otherwise the second item
//!
//! ## Embedded Versions
//! A JPEG with `embedded` in its name paired with a RAW file, or with a file
//! more than twice its size, is the camera's preview; the bigger file stays.
//!
//! Losers are soft-deleted and every pair row touching them is removed in a
//! single grouped store call.

mod rules;

pub use rules::{EmbeddedVersionRule, IdenticalPolicy, ResolutionRule, StrictIdenticalRule};

use crate::core::media::{DuplicatePair, MediaId, MediaItem, Resolution};
use crate::core::storage::MediaStore;
use crate::error::PersistenceError;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Names cameras and recovery tools give renamed files
pub const DEFAULT_RENAMED_PATTERN: &str =
    r"^f\d+\.(sr2|nef|arw|cr2|dng|raf|rw2|orf|pef|3fr|fff|iiq|rwl|srw|x3f|jpg|jpeg|png|tiff?|bmp|gif|webp)$";

/// Which rule decided a choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionRule {
    NotRenamed,
    EarlierTimestamp,
    LargerFile,
    Fallback,
    EmbeddedVersion,
}

impl std::fmt::Display for SelectionRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectionRule::NotRenamed => write!(f, "kept the file that was not auto-renamed"),
            SelectionRule::EarlierTimestamp => write!(f, "kept the earlier capture"),
            SelectionRule::LargerFile => write!(f, "kept the larger file"),
            SelectionRule::Fallback => write!(f, "kept the second file (tie)"),
            SelectionRule::EmbeddedVersion => write!(f, "dropped the embedded preview"),
        }
    }
}

/// Outcome of choosing between two items
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub keep: MediaId,
    pub discard: MediaId,
    pub rule: SelectionRule,
    pub confidence: f64,
}

impl Choice {
    fn new(keep: &MediaItem, discard: &MediaItem, rule: SelectionRule, confidence: f64) -> Self {
        Self {
            keep: keep.id,
            discard: discard.id,
            rule,
            confidence,
        }
    }
}

/// Keeper selection for identical pairs
#[derive(Debug, Clone)]
pub struct CanonicalSelector {
    renamed: Regex,
}

impl CanonicalSelector {
    /// Build a selector from an auto-renamed file name pattern
    /// (matched case-insensitively against the bare file name)
    pub fn new(renamed_pattern: &str) -> Result<Self, regex::Error> {
        let renamed = RegexBuilder::new(renamed_pattern)
            .case_insensitive(true)
            .build()?;
        Ok(Self { renamed })
    }

    pub fn is_auto_renamed(&self, file_name: &str) -> bool {
        self.renamed.is_match(file_name)
    }

    /// Pick the keeper of `a` and `b`. Deterministic for the same inputs.
    pub fn choose(&self, a: &MediaItem, b: &MediaItem) -> Choice {
        let a_renamed = self.is_auto_renamed(a.file_name());
        let b_renamed = self.is_auto_renamed(b.file_name());
        if a_renamed != b_renamed {
            return if a_renamed {
                Choice::new(b, a, SelectionRule::NotRenamed, 0.9)
            } else {
                Choice::new(a, b, SelectionRule::NotRenamed, 0.9)
            };
        }

        if let (Some(a_time), Some(b_time)) = (a.taken_at(), b.taken_at()) {
            if a_time < b_time {
                return Choice::new(a, b, SelectionRule::EarlierTimestamp, 0.8);
            }
            if b_time < a_time {
                return Choice::new(b, a, SelectionRule::EarlierTimestamp, 0.8);
            }
        }

        if a.size_bytes > b.size_bytes {
            return Choice::new(a, b, SelectionRule::LargerFile, 0.7);
        }
        if b.size_bytes > a.size_bytes {
            return Choice::new(b, a, SelectionRule::LargerFile, 0.7);
        }

        Choice::new(b, a, SelectionRule::Fallback, 0.7)
    }
}

/// What a resolution run decided
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolutionPlan {
    pub choices: Vec<Choice>,
    /// Pairs no rule matched
    pub undecided: usize,
    /// Pairs skipped because an item was missing, deleted, or already
    /// discarded earlier in the run
    pub skipped: usize,
}

impl ResolutionPlan {
    pub fn resolutions(&self) -> Vec<Resolution> {
        self.choices
            .iter()
            .map(|c| Resolution {
                keep: c.keep,
                discard: c.discard,
            })
            .collect()
    }
}

/// Applies a chain of rules to stored duplicate pairs
pub struct DuplicateResolver {
    rules: Vec<Box<dyn ResolutionRule>>,
}

impl DuplicateResolver {
    pub fn new(rules: Vec<Box<dyn ResolutionRule>>) -> Self {
        Self { rules }
    }

    /// Strict-identical first, then embedded previews
    pub fn standard(selector: CanonicalSelector) -> Self {
        Self::new(vec![
            Box::new(StrictIdenticalRule::new(selector, IdenticalPolicy)),
            Box::new(EmbeddedVersionRule),
        ])
    }

    /// Decide every pair. Earlier pairs win: once an item is discarded it is
    /// never kept or discarded again in the same run.
    pub fn plan(
        &self,
        pairs: &[DuplicatePair],
        items: &HashMap<MediaId, MediaItem>,
    ) -> ResolutionPlan {
        let mut plan = ResolutionPlan::default();
        let mut discarded: HashSet<MediaId> = HashSet::new();

        for pair in pairs {
            let (Some(a), Some(b)) = (items.get(&pair.media_id()), items.get(&pair.duplicate_id()))
            else {
                plan.skipped += 1;
                continue;
            };
            if a.is_deleted
                || b.is_deleted
                || discarded.contains(&a.id)
                || discarded.contains(&b.id)
            {
                plan.skipped += 1;
                continue;
            }

            let decided = self
                .rules
                .iter()
                .find_map(|rule| rule.evaluate(a, b, pair).map(|choice| (rule.name(), choice)));
            match decided {
                Some((rule, choice)) => {
                    tracing::debug!("{}: discard {}, {}", rule, choice.discard, choice.rule);
                    discarded.insert(choice.discard);
                    plan.choices.push(choice);
                }
                None => plan.undecided += 1,
            }
        }

        plan
    }

    /// Load pairs and items, plan, and (unless `dry_run`) apply the plan in
    /// one grouped call.
    pub fn resolve(
        &self,
        store: &dyn MediaStore,
        dry_run: bool,
    ) -> Result<ResolutionPlan, PersistenceError> {
        let pairs = store.duplicate_pairs()?;
        let mut ids: Vec<MediaId> = pairs
            .iter()
            .flat_map(|p| [p.media_id(), p.duplicate_id()])
            .collect();
        ids.sort_unstable();
        ids.dedup();

        let items: HashMap<MediaId, MediaItem> = store
            .find_by_ids(&ids)?
            .into_iter()
            .map(|item| (item.id, item))
            .collect();

        let plan = self.plan(&pairs, &items);
        tracing::info!(
            "Resolution plan: {} to discard, {} undecided, {} skipped",
            plan.choices.len(),
            plan.undecided,
            plan.skipped
        );

        if !dry_run && !plan.choices.is_empty() {
            store.resolve_duplicates(&plan.resolutions())?;
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::media::ExifData;
    use chrono::NaiveDate;

    fn selector() -> CanonicalSelector {
        CanonicalSelector::new(DEFAULT_RENAMED_PATTERN).unwrap()
    }

    fn item(n: u128, path: &str, size: u64) -> MediaItem {
        let mut item = MediaItem::new(path, size).with_id(MediaId::from_u128(n));
        item.exif = Some(ExifData {
            width: Some(4000),
            height: Some(3000),
            ..ExifData::default()
        });
        item
    }

    fn taken(item: &mut MediaItem, day: u32) {
        if let Some(exif) = item.exif.as_mut() {
            exif.taken_at =
                NaiveDate::from_ymd_opt(2021, 6, day).and_then(|d| d.and_hms_opt(12, 0, 0));
        }
    }

    #[test]
    fn recognises_auto_renamed_names() {
        let selector = selector();
        assert!(selector.is_auto_renamed("f0042.jpg"));
        assert!(selector.is_auto_renamed("F123.NEF"));
        assert!(selector.is_auto_renamed("f1.tif"));
        assert!(!selector.is_auto_renamed("vacation_2021.jpg"));
        assert!(!selector.is_auto_renamed("f0042.mov"));
        assert!(!selector.is_auto_renamed("ff0042.jpg"));
    }

    #[test]
    fn keeps_original_name_over_renamed_copy() {
        let renamed = item(1, "/recovered/f0042.jpg", 5000);
        let original = item(2, "/photos/vacation_2021.jpg", 5000);

        let choice = selector().choose(&renamed, &original);
        assert_eq!(choice.keep, original.id);
        assert_eq!(choice.rule, SelectionRule::NotRenamed);

        let reversed = selector().choose(&original, &renamed);
        assert_eq!(reversed.keep, original.id);
    }

    #[test]
    fn earlier_capture_wins_when_names_tie() {
        let mut a = item(1, "/a/one.jpg", 5000);
        let mut b = item(2, "/b/two.jpg", 9000);
        taken(&mut a, 20);
        taken(&mut b, 3);

        let choice = selector().choose(&a, &b);
        assert_eq!(choice.keep, b.id);
        assert_eq!(choice.rule, SelectionRule::EarlierTimestamp);
    }

    #[test]
    fn larger_file_wins_without_timestamps() {
        let a = item(1, "/a/one.jpg", 9000);
        let mut b = item(2, "/b/two.jpg", 5000);
        taken(&mut b, 1);

        let choice = selector().choose(&a, &b);
        assert_eq!(choice.keep, a.id);
        assert_eq!(choice.rule, SelectionRule::LargerFile);
    }

    #[test]
    fn full_tie_keeps_second_item() {
        let a = item(1, "/a/one.jpg", 5000);
        let b = item(2, "/b/two.jpg", 5000);

        let choice = selector().choose(&a, &b);
        assert_eq!(choice.keep, b.id);
        assert_eq!(choice.discard, a.id);
        assert_eq!(choice.rule, SelectionRule::Fallback);
    }

    #[test]
    fn choice_is_deterministic() {
        let a = item(1, "/a/f1.jpg", 5000);
        let b = item(2, "/b/f2.jpg", 5000);
        let selector = selector();
        assert_eq!(selector.choose(&a, &b), selector.choose(&a, &b));
    }

    #[test]
    fn plan_never_keeps_an_item_discarded_earlier() {
        let a = item(1, "/a/f1.jpg", 5000);
        let b = item(2, "/b/original.jpg", 5000);
        let c = item(3, "/c/another.jpg", 5000);
        let items: HashMap<MediaId, MediaItem> =
            [a.clone(), b.clone(), c.clone()].into_iter().map(|i| (i.id, i)).collect();
        let pairs = vec![
            DuplicatePair::new(b.id, c.id, 0, 240),
            DuplicatePair::new(a.id, b.id, 0, 240),
        ];

        let plan = DuplicateResolver::standard(selector()).plan(&pairs, &items);

        // b vs c ties and keeps c; b is gone so the a/b pair is skipped
        assert_eq!(plan.choices.len(), 1);
        assert_eq!(plan.choices[0].keep, c.id);
        assert_eq!(plan.skipped, 1);
    }

    #[test]
    fn plan_skips_pairs_that_are_not_identical() {
        let a = item(1, "/a/one.jpg", 5000);
        let b = item(2, "/b/two.png", 5000);
        let items: HashMap<MediaId, MediaItem> =
            [a.clone(), b.clone()].into_iter().map(|i| (i.id, i)).collect();
        let pairs = vec![DuplicatePair::new(a.id, b.id, 0, 240)];

        let plan = DuplicateResolver::standard(selector()).plan(&pairs, &items);
        assert!(plan.choices.is_empty());
        assert_eq!(plan.undecided, 1);
    }
}
