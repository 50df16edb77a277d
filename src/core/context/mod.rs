//! # Context Module
//!
//! Everything a process needs to run the pipeline, built once at start-up
//! and handed to each component. There is no global state.
//!
//! ## Backends
//! - [`PipelineContext::open`] - SQLite media store plus one SQLite queue
//!   database shared by every stage
//! - [`PipelineContext::in_memory`] - memory store and queues, for tests and
//!   one-shot runs

use crate::config::PipelineConfig;
use crate::core::audit::ConsistencyAuditor;
use crate::core::canonical::{DuplicateResolver, ResolutionPlan};
use crate::core::cluster::{ClusterResult, DuplicateClusterer};
use crate::core::extract::{ExifExtractor, QualityAnalyzer, ThumbnailGenerator};
use crate::core::fingerprint::FingerprintGenerator;
use crate::core::media::{MediaCategory, MediaId, Stage};
use crate::core::queue::{
    Clock, JobPayload, JobQueue, JobState, MemoryJobQueue, SqliteJobQueue, SystemClock,
};
use crate::core::scanner::{ScanConfig, WalkDirScanner};
use crate::core::stage::{
    enqueue_eligible, AnalysisHandler, DedupHandler, ExifHandler, HashHandler, ScanHandler,
    StageHandler, StageProcessor, StageRunner, ThumbnailHandler,
};
use crate::core::storage::{MediaStore, MemoryStore, SqliteStore};
use crate::core::worker::QueueWorker;
use crate::error::PipelineError;
use crate::events::{DedupEvent, EventSender, QueueEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub struct PipelineContext {
    pub config: PipelineConfig,
    pub store: Arc<dyn MediaStore>,
    pub queues: HashMap<Stage, Arc<dyn JobQueue>>,
    pub events: EventSender,
    pub clock: Arc<dyn Clock>,
}

impl PipelineContext {
    /// SQLite-backed context at the configured paths
    pub fn open(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let store: Arc<dyn MediaStore> = Arc::new(SqliteStore::open(&config.database_path)?);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let conn = SqliteJobQueue::connect(&config.queue_path)?;

        let mut queues: HashMap<Stage, Arc<dyn JobQueue>> = HashMap::new();
        for stage in Stage::ALL {
            let queue = SqliteJobQueue::with_connection(
                conn.clone(),
                stage,
                config.queue_settings(stage),
                clock.clone(),
            )?;
            queues.insert(stage, Arc::new(queue));
        }

        tracing::debug!(
            "Opened media store {} and queues {}",
            config.database_path.display(),
            config.queue_path.display()
        );
        Ok(Self {
            config,
            store,
            queues,
            events: EventSender::null(),
            clock,
        })
    }

    pub fn in_memory(config: PipelineConfig) -> Result<Self, PipelineError> {
        Self::in_memory_with_clock(config, Arc::new(SystemClock))
    }

    /// In-memory context whose queues read time from `clock`
    pub fn in_memory_with_clock(
        config: PipelineConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let queues = Stage::ALL
            .into_iter()
            .map(|stage| {
                let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::with_clock(
                    stage,
                    config.queue_settings(stage),
                    clock.clone(),
                ));
                (stage, queue)
            })
            .collect();
        Ok(Self {
            config,
            store: Arc::new(MemoryStore::new()),
            queues,
            events: EventSender::null(),
            clock,
        })
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    /// Swap the media store, e.g. for one with injected failures
    pub fn with_store(mut self, store: Arc<dyn MediaStore>) -> Self {
        self.store = store;
        self
    }

    pub fn queue(&self, stage: Stage) -> Result<Arc<dyn JobQueue>, PipelineError> {
        self.queues
            .get(&stage)
            .cloned()
            .ok_or_else(|| PipelineError::InvalidRequest(format!("no {} queue", stage)))
    }

    /// Processor for `stage`, wired to this context's store and events
    pub fn runner(&self, stage: Stage) -> Result<Box<dyn StageRunner>, PipelineError> {
        let config = &self.config;
        let runner: Box<dyn StageRunner> = match stage {
            Stage::Scan => {
                let scanner = WalkDirScanner::new(ScanConfig {
                    follow_symlinks: config.follow_symlinks,
                    include_hidden: config.include_hidden,
                    max_depth: None,
                });
                let handler = ScanHandler::new(scanner, config.scan_roots.clone())
                    .with_events(self.events.clone());
                self.processor(handler)
            }
            Stage::Exif => self.processor(ExifHandler::new(ExifExtractor::new())),
            Stage::Thumbnail => self.processor(ThumbnailHandler::new(
                ThumbnailGenerator::new(&config.thumbnail_dir).with_max_edge(config.thumbnail_edge),
            )),
            Stage::Hash => self.processor(HashHandler::new(FingerprintGenerator::default())),
            Stage::Dedup => self.processor(DedupHandler::new(config.dedup.comparator()?)),
            Stage::Analysis => {
                self.processor(AnalysisHandler::new(QualityAnalyzer::new(config.blur_threshold)))
            }
        };
        Ok(runner)
    }

    fn processor<H: StageHandler>(&self, handler: H) -> Box<dyn StageRunner> {
        Box::new(StageProcessor::new(handler, self.store.clone()).with_events(self.events.clone()))
    }

    /// Queue consumer for `stage` that feeds the next stage's queue
    pub fn worker(&self, stage: Stage) -> Result<QueueWorker, PipelineError> {
        let runner = self.runner(stage)?;
        let mut worker = QueueWorker::new(runner, self.queue(stage)?, self.store.clone())?
            .with_batch_size(self.config.stage(stage).batch_size)
            .with_poll_interval(Duration::from_millis(500));
        if let Some(next) = stage.next() {
            worker = worker.with_downstream(self.queue(next)?);
        }
        Ok(worker)
    }

    /// Enqueue work for `stage`: the configured roots for the scan stage,
    /// otherwise up to `limit` eligible items
    pub fn enqueue(&self, stage: Stage, limit: usize) -> Result<usize, PipelineError> {
        let queue = self.queue(stage)?;
        let jobs = match stage {
            Stage::Scan => {
                let payloads: Vec<JobPayload> = self
                    .config
                    .scan_roots
                    .iter()
                    .take(limit)
                    .map(JobPayload::scan)
                    .collect();
                if payloads.is_empty() {
                    0
                } else {
                    queue.enqueue(payloads)?.len()
                }
            }
            _ => enqueue_eligible(self.store.as_ref(), queue.as_ref(), limit)?,
        };
        self.events
            .send(QueueEvent::Enqueued { stage, jobs });
        Ok(jobs)
    }

    pub fn auditor(&self) -> ConsistencyAuditor {
        self.queues.values().fold(
            ConsistencyAuditor::new(self.store.clone(), self.config.audit_sample_size)
                .with_events(self.events.clone()),
            |auditor, queue| auditor.with_queue(queue.clone()),
        )
    }

    pub fn clusterer(&self) -> Result<DuplicateClusterer, PipelineError> {
        Ok(DuplicateClusterer::new(self.config.dedup.comparator()?)
            .with_index_min_items(self.config.dedup.index_min_items))
    }

    pub fn resolver(&self) -> Result<DuplicateResolver, PipelineError> {
        Ok(DuplicateResolver::standard(self.config.dedup.selector()?))
    }

    /// Remove every job of `stage` in `state`
    pub fn reset(&self, stage: Stage, state: JobState) -> Result<usize, PipelineError> {
        let removed = self.queue(stage)?.reset_state(state)?;
        self.events.send(QueueEvent::Reset {
            stage,
            state,
            removed,
        });
        Ok(removed)
    }

    /// Remove every waiting and delayed job of `stage`
    pub fn drain(&self, stage: Stage) -> Result<usize, PipelineError> {
        let removed = self.queue(stage)?.drain()?;
        self.events
            .send(QueueEvent::Drained { stage, removed });
        Ok(removed)
    }

    pub fn pause(&self, stage: Stage) -> Result<(), PipelineError> {
        self.queue(stage)?.pause()?;
        tracing::info!("Paused the {} queue", stage.queue_name());
        self.events.send(QueueEvent::Paused { stage });
        Ok(())
    }

    pub fn resume(&self, stage: Stage) -> Result<(), PipelineError> {
        self.queue(stage)?.resume()?;
        tracing::info!("Resumed the {} queue", stage.queue_name());
        self.events.send(QueueEvent::Resumed { stage });
        Ok(())
    }

    /// Cluster every live fingerprinted item, one category at a time
    pub fn cluster_store(&self) -> Result<ClusterResult<MediaId>, PipelineError> {
        let mut items = Vec::new();
        for category in [MediaCategory::Image, MediaCategory::Raw, MediaCategory::Video] {
            items.extend(
                self.store
                    .fingerprinted(category)?
                    .into_iter()
                    .map(|(id, fingerprint)| (id, category, fingerprint)),
            );
        }
        let result = self.clusterer()?.cluster_by_category(&items);
        self.events.send(DedupEvent::Clustered {
            exact_groups: result.exact_groups.len(),
            near_groups: result.near_groups.len(),
            skipped_comparisons: result.skipped_comparisons,
        });
        Ok(result)
    }

    /// Soft-delete the losing copy of every identical stored pair
    pub fn resolve_identical(&self, dry_run: bool) -> Result<ResolutionPlan, PipelineError> {
        let plan = self.resolver()?.resolve(self.store.as_ref(), dry_run)?;
        self.events.send(DedupEvent::Resolved {
            discarded: plan.choices.len(),
            undecided: plan.undecided,
            skipped: plan.skipped,
            dry_run,
        });
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::worker::CancelToken;
    use crate::events::Event;
    use tempfile::TempDir;

    #[test]
    fn every_stage_has_a_queue_and_runner() {
        let context = PipelineContext::in_memory(PipelineConfig::default()).unwrap();
        for stage in Stage::ALL {
            assert_eq!(context.queue(stage).unwrap().stage(), stage);
            assert_eq!(context.runner(stage).unwrap().stage(), stage);
        }
    }

    #[test]
    fn queue_settings_come_from_config() {
        let mut config = PipelineConfig::default();
        config.stages.hash.concurrency = 3;
        let context = PipelineContext::in_memory(config).unwrap();
        assert_eq!(context.queue(Stage::Hash).unwrap().settings().concurrency, 3);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = PipelineConfig::default();
        config.stages.exif.concurrency = 0;
        assert!(matches!(
            PipelineContext::in_memory(config),
            Err(PipelineError::Config(_))
        ));
    }

    #[test]
    fn admin_operations_emit_events() {
        let (sender, receiver) = crate::events::EventChannel::new();
        let context = PipelineContext::in_memory(PipelineConfig {
            scan_roots: vec!["/a".into(), "/b".into()],
            ..PipelineConfig::default()
        })
        .unwrap()
        .with_events(sender);

        assert_eq!(context.enqueue(Stage::Scan, 10).unwrap(), 2);
        context.pause(Stage::Scan).unwrap();
        assert_eq!(context.queue(Stage::Scan).unwrap().counts().unwrap().paused, 2);
        context.resume(Stage::Scan).unwrap();
        assert_eq!(context.drain(Stage::Scan).unwrap(), 2);
        assert!(context.reset(Stage::Scan, JobState::Active).is_err());

        let events = receiver.drain();
        assert!(matches!(
            events.last(),
            Some(Event::Queue(QueueEvent::Drained { removed: 2, .. }))
        ));
        assert_eq!(events.len(), 4);
    }

    #[test]
    fn sqlite_queues_share_one_file() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig {
            database_path: dir.path().join("media.db"),
            queue_path: dir.path().join("queues.db"),
            thumbnail_dir: dir.path().join("thumbs"),
            scan_roots: vec![dir.path().to_path_buf()],
            ..PipelineConfig::default()
        };
        let context = PipelineContext::open(config).unwrap();

        assert_eq!(context.enqueue(Stage::Scan, 10).unwrap(), 1);
        assert_eq!(context.queue(Stage::Scan).unwrap().counts().unwrap().waiting, 1);
        assert_eq!(context.queue(Stage::Exif).unwrap().counts().unwrap().total(), 0);

        let summary = context
            .runner(Stage::Scan)
            .unwrap()
            .run_queue_batch(
                context.queue(Stage::Scan).unwrap().as_ref(),
                &crate::core::queue::WorkerId::new("w"),
                10,
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(summary.processed, 1);
    }
}
