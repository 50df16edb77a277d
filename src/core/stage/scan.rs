//! Folder walk: turns scan roots into new media rows.

use super::{JobUnit, StageHandler};
use crate::core::media::{MediaId, Stage, UpsertBatch};
use crate::core::queue::{Job, JobPayload, ScanPayload};
use crate::core::scanner::WalkDirScanner;
use crate::core::storage::MediaStore;
use crate::error::{ItemError, PersistenceError};
use crate::events::EventSender;
use std::path::PathBuf;

pub struct ScanHandler {
    scanner: WalkDirScanner,
    roots: Vec<PathBuf>,
    events: EventSender,
}

impl ScanHandler {
    /// `roots` are the folders a storage-driven batch walks
    pub fn new(scanner: WalkDirScanner, roots: Vec<PathBuf>) -> Self {
        Self {
            scanner,
            roots,
            events: EventSender::null(),
        }
    }

    /// Forward per-folder scan progress
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }
}

impl StageHandler for ScanHandler {
    type Unit = ScanPayload;
    type Context = ();

    fn stage(&self) -> Stage {
        Stage::Scan
    }

    fn select(&self, _: &dyn MediaStore, limit: usize) -> Result<Vec<ScanPayload>, PersistenceError> {
        Ok(self
            .roots
            .iter()
            .take(limit)
            .map(|root| ScanPayload { root: root.clone() })
            .collect())
    }

    fn resolve(
        &self,
        _: &dyn MediaStore,
        jobs: &[Job],
    ) -> Result<Vec<JobUnit<ScanPayload>>, PersistenceError> {
        Ok(jobs
            .iter()
            .map(|job| match &job.payload {
                JobPayload::Scan(payload) => JobUnit::Ready(payload.clone()),
                other => JobUnit::Missing(format!("{} payload on the scan queue", other.stage())),
            })
            .collect())
    }

    fn begin_batch(&self, _: &dyn MediaStore, _: &[ScanPayload]) -> Result<(), PersistenceError> {
        Ok(())
    }

    fn process(&self, unit: &ScanPayload, _: &()) -> Result<UpsertBatch, ItemError> {
        let result = self.scanner.scan(&unit.root, &self.events)?;
        for error in &result.errors {
            tracing::warn!("Scan of {}: {}", unit.root.display(), error);
        }
        tracing::info!(
            "Scanned {}: {} media files",
            unit.root.display(),
            result.media.len()
        );
        Ok(UpsertBatch {
            media: result.media,
            ..UpsertBatch::default()
        })
    }

    fn media_id(&self, _: &ScanPayload) -> Option<MediaId> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scanner::ScanConfig;
    use crate::core::stage::{StageProcessor, StageRunner};
    use crate::core::storage::MemoryStore;
    use crate::core::worker::CancelToken;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn scan_batch_stores_discovered_media() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("b.cr2"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let store = Arc::new(MemoryStore::new());
        let handler = ScanHandler::new(
            WalkDirScanner::new(ScanConfig::default()),
            vec![dir.path().to_path_buf()],
        );
        let processor = StageProcessor::new(handler, store.clone());

        let summary = processor.run_batch(10, 1, &CancelToken::new()).unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.writes, 1);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn missing_root_is_a_definitive_failure() {
        let store = Arc::new(MemoryStore::new());
        let handler = ScanHandler::new(
            WalkDirScanner::default(),
            vec![PathBuf::from("/definitely/not/here")],
        );
        let processor = StageProcessor::new(handler, store);

        let summary = processor.run_batch(10, 1, &CancelToken::new()).unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.writes, 0);
    }
}
