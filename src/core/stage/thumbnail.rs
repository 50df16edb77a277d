//! Thumbnail stage: writes a JPEG preview and records the source content hash.

use super::{resolve_media, select_media, JobUnit, StageHandler};
use crate::core::extract::ThumbnailGenerator;
use crate::core::media::{MediaId, MediaItem, Stage, UpsertBatch};
use crate::core::queue::Job;
use crate::core::storage::MediaStore;
use crate::error::{ItemError, PersistenceError};

pub struct ThumbnailHandler {
    generator: ThumbnailGenerator,
}

impl ThumbnailHandler {
    pub fn new(generator: ThumbnailGenerator) -> Self {
        Self { generator }
    }
}

impl StageHandler for ThumbnailHandler {
    type Unit = MediaItem;
    type Context = ();

    fn stage(&self) -> Stage {
        Stage::Thumbnail
    }

    fn select(&self, store: &dyn MediaStore, limit: usize) -> Result<Vec<MediaItem>, PersistenceError> {
        select_media(store, Stage::Thumbnail, limit)
    }

    fn resolve(
        &self,
        store: &dyn MediaStore,
        jobs: &[Job],
    ) -> Result<Vec<JobUnit<MediaItem>>, PersistenceError> {
        resolve_media(store, Stage::Thumbnail, jobs)
    }

    fn begin_batch(&self, _: &dyn MediaStore, _: &[MediaItem]) -> Result<(), PersistenceError> {
        Ok(())
    }

    fn process(&self, item: &MediaItem, _: &()) -> Result<UpsertBatch, ItemError> {
        let record = self.generator.generate(item.id, &item.path)?;
        Ok(UpsertBatch {
            thumbnails: vec![record],
            ..UpsertBatch::default()
        })
    }

    fn media_id(&self, item: &MediaItem) -> Option<MediaId> {
        Some(item.id)
    }
}
