//! Duplicate check stage: compares each item against every fingerprinted
//! item of its category and records the pairs within the distance limit.

use super::{resolve_media, select_media, JobUnit, StageHandler};
use crate::core::comparator::{HashComparator, SimilarityTier};
use crate::core::fingerprint::Fingerprint;
use crate::core::media::{DuplicatePair, MediaCategory, MediaId, MediaItem, Stage, UpsertBatch};
use crate::core::queue::Job;
use crate::core::storage::MediaStore;
use crate::error::{CompareError, ItemError, PersistenceError};
use std::collections::HashMap;

/// Fingerprinted corpus per category, loaded once per batch
pub type Corpus = HashMap<MediaCategory, Vec<(MediaId, Fingerprint)>>;

#[derive(Debug, Default)]
pub struct DedupHandler {
    comparator: HashComparator,
}

impl DedupHandler {
    pub fn new(comparator: HashComparator) -> Self {
        Self { comparator }
    }
}

impl StageHandler for DedupHandler {
    type Unit = MediaItem;
    type Context = Corpus;

    fn stage(&self) -> Stage {
        Stage::Dedup
    }

    fn select(&self, store: &dyn MediaStore, limit: usize) -> Result<Vec<MediaItem>, PersistenceError> {
        select_media(store, Stage::Dedup, limit)
    }

    fn resolve(
        &self,
        store: &dyn MediaStore,
        jobs: &[Job],
    ) -> Result<Vec<JobUnit<MediaItem>>, PersistenceError> {
        resolve_media(store, Stage::Dedup, jobs)
    }

    fn begin_batch(
        &self,
        store: &dyn MediaStore,
        units: &[MediaItem],
    ) -> Result<Corpus, PersistenceError> {
        let mut corpus = Corpus::new();
        for item in units {
            if !corpus.contains_key(&item.category) {
                corpus.insert(item.category, store.fingerprinted(item.category)?);
            }
        }
        Ok(corpus)
    }

    fn process(&self, item: &MediaItem, corpus: &Corpus) -> Result<UpsertBatch, ItemError> {
        let fingerprint = item
            .fingerprint
            .as_ref()
            .ok_or_else(|| ItemError::MissingInput(format!("{} has no fingerprint", item.id)))?;

        let mut duplicates = Vec::new();
        for (other, candidate) in corpus.get(&item.category).into_iter().flatten() {
            if *other == item.id {
                continue;
            }
            let comparison = match self.comparator.compare(fingerprint, candidate) {
                Ok(comparison) => comparison,
                Err(CompareError::LengthMismatch { left, right }) => {
                    tracing::debug!(
                        "Skipping {} vs {}: fingerprint lengths {} and {}",
                        item.id,
                        other,
                        left,
                        right
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let within = comparison.tier == SimilarityTier::Exact
                || self.comparator.is_near_duplicate(&comparison);
            if within {
                duplicates.push(DuplicatePair::new(
                    item.id,
                    *other,
                    comparison.distance,
                    comparison.total_bits,
                ));
            }
        }

        Ok(UpsertBatch {
            duplicates,
            ..UpsertBatch::default()
        })
    }

    fn media_id(&self, item: &MediaItem) -> Option<MediaId> {
        Some(item.id)
    }
}
