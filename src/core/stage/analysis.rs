//! Analysis stage: sharpness, exposure and blur detection.

use super::{resolve_media, select_media, JobUnit, StageHandler};
use crate::core::extract::QualityAnalyzer;
use crate::core::media::{AnalysisRecord, MediaId, MediaItem, Stage, UpsertBatch};
use crate::core::queue::Job;
use crate::core::storage::MediaStore;
use crate::error::{ItemError, PersistenceError};

pub struct AnalysisHandler {
    analyzer: QualityAnalyzer,
}

impl AnalysisHandler {
    pub fn new(analyzer: QualityAnalyzer) -> Self {
        Self { analyzer }
    }
}

impl StageHandler for AnalysisHandler {
    type Unit = MediaItem;
    type Context = ();

    fn stage(&self) -> Stage {
        Stage::Analysis
    }

    fn select(&self, store: &dyn MediaStore, limit: usize) -> Result<Vec<MediaItem>, PersistenceError> {
        select_media(store, Stage::Analysis, limit)
    }

    fn resolve(
        &self,
        store: &dyn MediaStore,
        jobs: &[Job],
    ) -> Result<Vec<JobUnit<MediaItem>>, PersistenceError> {
        resolve_media(store, Stage::Analysis, jobs)
    }

    fn begin_batch(&self, _: &dyn MediaStore, _: &[MediaItem]) -> Result<(), PersistenceError> {
        Ok(())
    }

    fn process(&self, item: &MediaItem, _: &()) -> Result<UpsertBatch, ItemError> {
        let data = self.analyzer.analyze_file(&item.path)?;
        if data.is_blurry {
            tracing::debug!("{} looks blurry (sharpness {:.1})", item.path.display(), data.sharpness);
        }
        Ok(UpsertBatch {
            analysis: vec![AnalysisRecord {
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
