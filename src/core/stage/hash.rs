//! Visual hash stage: stores a dHash fingerprint per image.

use super::{resolve_media, select_media, JobUnit, StageHandler};
use crate::core::fingerprint::{decode_path, FingerprintGenerator};
use crate::core::media::{FingerprintRecord, MediaId, MediaItem, Stage, UpsertBatch};
use crate::core::queue::Job;
use crate::core::storage::MediaStore;
use crate::error::{ItemError, PersistenceError};

#[derive(Debug, Default)]
pub struct HashHandler {
    generator: FingerprintGenerator,
}

impl HashHandler {
    pub fn new(generator: FingerprintGenerator) -> Self {
        Self { generator }
    }
}

impl StageHandler for HashHandler {
    type Unit = MediaItem;
    type Context = ();

    fn stage(&self) -> Stage {
        Stage::Hash
    }

    fn select(&self, store: &dyn MediaStore, limit: usize) -> Result<Vec<MediaItem>, PersistenceError> {
        select_media(store, Stage::Hash, limit)
    }

    fn resolve(
        &self,
        store: &dyn MediaStore,
        jobs: &[Job],
    ) -> Result<Vec<JobUnit<MediaItem>>, PersistenceError> {
        resolve_media(store, Stage::Hash, jobs)
    }

    fn begin_batch(&self, _: &dyn MediaStore, _: &[MediaItem]) -> Result<(), PersistenceError> {
        Ok(())
    }

    fn process(&self, item: &MediaItem, _: &()) -> Result<UpsertBatch, ItemError> {
        let image = decode_path(&item.path)?;
        let fingerprint = self.generator.fingerprint_image(&image)?;
        Ok(UpsertBatch {
            fingerprints: vec![FingerprintRecord {
                media_id: item.id,
                fingerprint,
            }],
            ..UpsertBatch::default()
        })
    }

    fn media_id(&self, item: &MediaItem) -> Option<MediaId> {
        Some(item.id)
    }
}
