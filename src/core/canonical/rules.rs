//! Resolution rules evaluated in order until one decides a pair.

use super::{CanonicalSelector, Choice, SelectionRule};
use crate::core::media::{DuplicatePair, MediaCategory, MediaItem};

/// A rule that may decide which item of a stored pair to discard
pub trait ResolutionRule: Send + Sync {
    /// `None` leaves the pair to the next rule
    fn evaluate(&self, a: &MediaItem, b: &MediaItem, pair: &DuplicatePair) -> Option<Choice>;

    fn name(&self) -> &'static str;
}

/// When two items are byte-identical for resolution purposes
#[derive(Debug, Clone, Copy, Default)]
pub struct IdenticalPolicy;

impl IdenticalPolicy {
    pub fn is_identical(&self, a: &MediaItem, b: &MediaItem, pair: &DuplicatePair) -> bool {
        a.size_bytes == b.size_bytes
            && a.extension() == b.extension()
            && a.dimensions().is_some()
            && a.dimensions() == b.dimensions()
            && pair.hamming_distance() == 0
            && pair.similarity_score() >= 1.0
    }
}

/// Identical pairs resolved by the canonical selector
pub struct StrictIdenticalRule {
    selector: CanonicalSelector,
    policy: IdenticalPolicy,
}

impl StrictIdenticalRule {
    pub fn new(selector: CanonicalSelector, policy: IdenticalPolicy) -> Self {
        Self { selector, policy }
    }
}

impl ResolutionRule for StrictIdenticalRule {
    fn evaluate(&self, a: &MediaItem, b: &MediaItem, pair: &DuplicatePair) -> Option<Choice> {
        self.policy
            .is_identical(a, b, pair)
            .then(|| self.selector.choose(a, b))
    }

    fn name(&self) -> &'static str {
        "strict-identical"
    }
}

/// Camera previews extracted next to their RAW originals
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddedVersionRule;

impl EmbeddedVersionRule {
    fn is_embedded_preview(preview: &MediaItem, other: &MediaItem) -> bool {
        let is_jpeg = matches!(preview.extension().as_str(), "jpg" | "jpeg");
        let named_embedded = preview.file_name().to_lowercase().contains("embedded");
        let bigger = other.category == MediaCategory::Raw
            || other.size_bytes > preview.size_bytes.saturating_mul(2);
        is_jpeg && named_embedded && bigger
    }
}

impl ResolutionRule for EmbeddedVersionRule {
    fn evaluate(&self, a: &MediaItem, b: &MediaItem, _pair: &DuplicatePair) -> Option<Choice> {
        if Self::is_embedded_preview(a, b) {
            return Some(Choice::new(b, a, SelectionRule::EmbeddedVersion, 0.95));
        }
        if Self::is_embedded_preview(b, a) {
            return Some(Choice::new(a, b, SelectionRule::EmbeddedVersion, 0.95));
        }
        None
    }

    fn name(&self) -> &'static str {
        "embedded-version"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::media::MediaId;

    fn item(n: u128, path: &str, size: u64) -> MediaItem {
        MediaItem::new(path, size).with_id(MediaId::from_u128(n))
    }

    #[test]
    fn embedded_preview_loses_to_raw() {
        let preview = item(1, "/a/DSC01_embedded.JPG", 900);
        let raw = item(2, "/a/DSC01.ARW", 800);
        let pair = DuplicatePair::new(preview.id, raw.id, 2, 240);

        let choice = EmbeddedVersionRule.evaluate(&preview, &raw, &pair).unwrap();
        assert_eq!(choice.keep, raw.id);
        assert_eq!(choice.rule, SelectionRule::EmbeddedVersion);

        let reversed = EmbeddedVersionRule.evaluate(&raw, &preview, &pair).unwrap();
        assert_eq!(reversed.discard, preview.id);
    }

    #[test]
    fn embedded_preview_needs_a_much_larger_partner() {
        let preview = item(1, "/a/embedded.jpg", 1000);
        let similar = item(2, "/a/other.jpg", 1500);
        let pair = DuplicatePair::new(preview.id, similar.id, 2, 240);
        assert!(EmbeddedVersionRule.evaluate(&preview, &similar, &pair).is_none());

        let large = item(3, "/a/large.png", 2001);
        assert!(EmbeddedVersionRule.evaluate(&preview, &large, &pair).is_some());
    }

    #[test]
    fn identical_requires_known_matching_dimensions() {
        let a = item(1, "/a/one.jpg", 10);
        let b = item(2, "/b/two.jpg", 10);
        let pair = DuplicatePair::new(a.id, b.id, 0, 240);
        assert!(!IdenticalPolicy.is_identical(&a, &b, &pair));
    }
}
