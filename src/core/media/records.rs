//! Rows produced by stages and written through the grouped store calls.
//!
//! Each row type has a stable conflict key so redelivered work overwrites
//! instead of duplicating:
//!
//! | Row                 | Conflict key                  |
//! |---------------------|-------------------------------|
//! | `NewMedia`          | `path` (existing rows kept)   |
//! | `ExifRecord`        | `media_id`                    |
//! | `ThumbnailRecord`   | `media_id`                    |
//! | `FingerprintRecord` | `media_id`                    |
//! | `AnalysisRecord`    | `media_id`                    |
//! | `DuplicatePair`     | `(media_id, duplicate_id)`    |

use super::{AnalysisData, ExifData, MediaCategory, MediaId, StageStatus};
use crate::core::comparator::similarity_score;
use crate::core::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A file discovered by the scan stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMedia {
    pub id: MediaId,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub category: MediaCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExifRecord {
    pub media_id: MediaId,
    pub data: ExifData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThumbnailRecord {
    pub media_id: MediaId,
    pub thumbnail_path: PathBuf,
    /// xxh3 of the source file contents
    pub file_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub media_id: MediaId,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub media_id: MediaId,
    pub data: AnalysisData,
}

/// Two items whose fingerprints are within the duplicate threshold.
///
/// Stored with the smaller id as `media_id`. The score is always derived from
/// the distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicatePair {
    media_id: MediaId,
    duplicate_id: MediaId,
    hamming_distance: u32,
    similarity_score: f64,
}

impl DuplicatePair {
    pub fn new(a: MediaId, b: MediaId, hamming_distance: u32, total_bits: u32) -> Self {
        let (media_id, duplicate_id) = if a <= b { (a, b) } else { (b, a) };
        Self {
            media_id,
            duplicate_id,
            hamming_distance,
            similarity_score: similarity_score(hamming_distance, total_bits),
        }
    }

    /// Rebuild a stored pair; the score was derived when it was written
    pub(crate) fn from_stored(
        media_id: MediaId,
        duplicate_id: MediaId,
        hamming_distance: u32,
        similarity_score: f64,
    ) -> Self {
        let (media_id, duplicate_id) = if media_id <= duplicate_id {
            (media_id, duplicate_id)
        } else {
            (duplicate_id, media_id)
        };
        Self {
            media_id,
            duplicate_id,
            hamming_distance,
            similarity_score,
        }
    }

    /// The smaller id of the two
    pub fn media_id(&self) -> MediaId {
        self.media_id
    }

    pub fn duplicate_id(&self) -> MediaId {
        self.duplicate_id
    }

    pub fn hamming_distance(&self) -> u32 {
        self.hamming_distance
    }

    pub fn similarity_score(&self) -> f64 {
        self.similarity_score
    }

    pub fn involves(&self, id: MediaId) -> bool {
        self.media_id == id || self.duplicate_id == id
    }

    /// The member that is not `id`
    pub fn other(&self, id: MediaId) -> Option<MediaId> {
        if self.media_id == id {
            Some(self.duplicate_id)
        } else if self.duplicate_id == id {
            Some(self.media_id)
        } else {
            None
        }
    }

    pub fn key(&self) -> (MediaId, MediaId) {
        (self.media_id, self.duplicate_id)
    }
}

/// Terminal outcome of one item in one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub id: MediaId,
    pub status: StageStatus,
    pub reason: Option<String>,
}

impl StatusUpdate {
    pub fn done(id: MediaId) -> Self {
        Self {
            id,
            status: StageStatus::Done,
            reason: None,
        }
    }

    pub fn failed(id: MediaId, reason: impl Into<String>) -> Self {
        Self {
            id,
            status: StageStatus::Failed,
            reason: Some(reason.into()),
        }
    }
}

/// Every row a batch produced, written in one grouped upsert
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpsertBatch {
    pub media: Vec<NewMedia>,
    pub exif: Vec<ExifRecord>,
    pub thumbnails: Vec<ThumbnailRecord>,
    pub fingerprints: Vec<FingerprintRecord>,
    pub duplicates: Vec<DuplicatePair>,
    pub analysis: Vec<AnalysisRecord>,
}

impl UpsertBatch {
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.media.len()
            + self.exif.len()
            + self.thumbnails.len()
            + self.fingerprints.len()
            + self.duplicates.len()
            + self.analysis.len()
    }

    /// Move every row of `other` into this batch
    pub fn append(&mut self, mut other: UpsertBatch) {
        self.media.append(&mut other.media);
        self.exif.append(&mut other.exif);
        self.thumbnails.append(&mut other.thumbnails);
        self.fingerprints.append(&mut other.fingerprints);
        self.duplicates.append(&mut other.duplicates);
        self.analysis.append(&mut other.analysis);
    }
}

/// Keep one item of an identical pair and soft-delete the other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub keep: MediaId,
    pub discard: MediaId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_are_stored_in_ascending_direction() {
        let low = MediaId::from_u128(1);
        let high = MediaId::from_u128(2);

        let forward = DuplicatePair::new(low, high, 4, 240);
        let backward = DuplicatePair::new(high, low, 4, 240);
        assert_eq!(forward, backward);
        assert_eq!(forward.key(), (low, high));
        assert_eq!(forward.other(high), Some(low));
        assert_eq!(forward.other(MediaId::from_u128(3)), None);
    }

    #[test]
    fn pair_score_comes_from_distance() {
        let pair = DuplicatePair::new(MediaId::from_u128(1), MediaId::from_u128(2), 0, 240);
        assert_eq!(pair.similarity_score(), 1.0);
        assert_eq!(pair.hamming_distance(), 0);

        let near = DuplicatePair::new(MediaId::from_u128(1), MediaId::from_u128(2), 24, 240);
        assert!((near.similarity_score() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn stored_pairs_keep_ascending_direction() {
        let pair = DuplicatePair::from_stored(MediaId::from_u128(9), MediaId::from_u128(3), 2, 0.99);
        assert_eq!(pair.media_id(), MediaId::from_u128(3));
        assert_eq!(pair.duplicate_id(), MediaId::from_u128(9));
        assert_eq!(pair.similarity_score(), 0.99);
    }
}
