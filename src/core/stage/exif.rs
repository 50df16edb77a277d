//! EXIF stage: reads capture metadata for image and raw files.

use super::{resolve_media, select_media, JobUnit, StageHandler};
use crate::core::extract::ExifExtractor;
use crate::core::media::{ExifRecord, MediaId, MediaItem, Stage, UpsertBatch};
use crate::core::queue::Job;
use crate::core::storage::MediaStore;
use crate::error::{ItemError, PersistenceError};

#[derive(Debug, Default)]
pub struct ExifHandler {
    extractor: ExifExtractor,
}

impl ExifHandler {
    pub fn new(extractor: ExifExtractor) -> Self {
        Self { extractor }
    }
}

impl StageHandler for ExifHandler {
    type Unit = MediaItem;
    type Context = ();

    fn stage(&self) -> Stage {
        Stage::Exif
    }

    fn select(&self, store: &dyn MediaStore, limit: usize) -> Result<Vec<MediaItem>, PersistenceError> {
        select_media(store, Stage::Exif, limit)
    }

    fn resolve(
        &self,
        store: &dyn MediaStore,
        jobs: &[Job],
    ) -> Result<Vec<JobUnit<MediaItem>>, PersistenceError> {
        resolve_media(store, Stage::Exif, jobs)
    }

    fn begin_batch(&self, _: &dyn MediaStore, _: &[MediaItem]) -> Result<(), PersistenceError> {
        Ok(())
    }

    fn process(&self, item: &MediaItem, _: &()) -> Result<UpsertBatch, ItemError> {
        let data = self.extractor.extract(&item.path)?;
        Ok(UpsertBatch {
            exif: vec![ExifRecord {
                media_id: item.id,
                data,
            }],
            ..UpsertBatch::default()
        })
    }

    fn media_id(&self, item: &MediaItem) -> Option<MediaId> {
        Some(item.id)
    }
}
