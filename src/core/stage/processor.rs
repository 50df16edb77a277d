//! Batch execution shared by every stage.

use super::{BatchOutcome, BatchSummary, ItemOutcome, JobUnit, StageHandler, StageRunner};
use crate::core::media::{Stage, StatusUpdate, UpsertBatch};
use crate::core::queue::{FailDisposition, Job, JobQueue, WorkerId};
use crate::core::storage::MediaStore;
use crate::core::worker::CancelToken;
use crate::error::{PersistenceError, PipelineError, QueueError};
use crate::events::{EventSender, QueueEvent, StageEvent};
use rayon::prelude::*;
use std::sync::Arc;

/// Runs a [`StageHandler`] over batches and persists the results
pub struct StageProcessor<H: StageHandler> {
    handler: H,
    store: Arc<dyn MediaStore>,
    events: EventSender,
}

/// What one leased job resolved to
enum Settlement {
    Run(usize),
    Complete,
    Fail(String),
}

impl<H: StageHandler> StageProcessor<H> {
    pub fn new(handler: H, store: Arc<dyn MediaStore>) -> Self {
        Self {
            handler,
            store,
            events: EventSender::null(),
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Process units, then persist all rows and statuses with one grouped
    /// write.
    ///
    /// `final_attempt[i]` marks units that will not be redelivered; a
    /// retryable failure of such a unit is recorded as `Failed` like any
    /// other.
    fn execute(
        &self,
        units: &[H::Unit],
        final_attempt: &[bool],
        concurrency: usize,
        cancel: &CancelToken,
    ) -> Result<(BatchOutcome, usize), PipelineError> {
        let stage = self.handler.stage();
        if units.is_empty() {
            return Ok((BatchOutcome::default(), 0));
        }

        self.events.send(StageEvent::BatchStarted {
            stage,
            items: units.len(),
        });

        let context = self
            .handler
            .begin_batch(self.store.as_ref(), units)
            .map_err(|e| self.abort(e))?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(concurrency.clamp(1, units.len()))
            .build()
            .map_err(|e| PipelineError::WorkerPool(e.to_string()))?;

        let results: Vec<Option<Result<UpsertBatch, _>>> = pool.install(|| {
            units
                .par_iter()
                .map(|unit| {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    Some(self.handler.process(unit, &context))
                })
                .collect()
        });

        let mut rows = UpsertBatch::default();
        let mut statuses = Vec::new();
        let mut slots = Vec::with_capacity(units.len());

        for ((unit, result), last) in units.iter().zip(results).zip(final_attempt) {
            let media_id = self.handler.media_id(unit);
            let slot = match result {
                None => ItemOutcome::Skipped,
                Some(Ok(batch)) => {
                    rows.append(batch);
                    if let Some(id) = media_id {
                        statuses.push(StatusUpdate::done(id));
                    }
                    ItemOutcome::Done
                }
                Some(Err(e)) => {
                    let retryable = e.is_retryable() && !*last;
                    let message = e.to_string();
                    if !retryable {
                        if let Some(id) = media_id {
                            statuses.push(StatusUpdate::failed(id, message.clone()));
                        }
                    }
                    self.events.send(StageEvent::ItemFailed {
                        stage,
                        media_id,
                        message: message.clone(),
                        retryable,
                    });
                    ItemOutcome::Failed { message, retryable }
                }
            };
            slots.push(slot);
        }

        let writes = self.persist(stage, &rows, &statuses).map_err(|e| self.abort(e))?;
        Ok((BatchOutcome { slots }, writes))
    }

    /// Rows and statuses in one store transaction; nothing to write costs
    /// no call
    fn persist(
        &self,
        stage: Stage,
        rows: &UpsertBatch,
        statuses: &[StatusUpdate],
    ) -> Result<usize, PersistenceError> {
        if rows.is_empty() && statuses.is_empty() {
            return Ok(0);
        }
        let persisted = self.store.persist_batch(stage, rows, statuses)?;
        tracing::debug!(
            "{}: persisted {} rows and {} statuses",
            stage,
            persisted.rows,
            persisted.statuses
        );
        Ok(1)
    }

    fn abort(&self, error: PersistenceError) -> PipelineError {
        let stage = self.handler.stage();
        tracing::error!("{} batch aborted: {}", stage, error);
        self.events.send(StageEvent::BatchAborted {
            stage,
            message: error.to_string(),
        });
        PipelineError::Persistence(error)
    }

    fn finish(&self, summary: BatchSummary) -> BatchSummary {
        if summary.total > 0 {
            tracing::info!(
                "{} batch: {} processed, {} failed, {} skipped of {} ({} writes)",
                summary.stage,
                summary.processed,
                summary.failed,
                summary.skipped,
                summary.total,
                summary.writes
            );
            self.events
                .send(StageEvent::BatchCompleted {
                    stage: summary.stage,
                    summary,
                });
        }
        summary
    }

    fn release_all(&self, queue: &dyn JobQueue, worker: &WorkerId, jobs: &[Job]) {
        for job in jobs {
            if let Err(e) = queue.release(job.id, worker) {
                tracing::warn!("Failed to release job {}: {}", job.id, e);
            }
        }
    }
}

/// Log acknowledgements that lost their lease; anything else is fatal
fn acknowledged<T>(job: &Job, result: Result<T, QueueError>) -> Result<Option<T>, PipelineError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(QueueError::NotLeaseHolder { .. }) | Err(QueueError::UnknownJob(_)) => {
            tracing::warn!("Job {} was settled elsewhere, result dropped", job.id);
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

impl<H: StageHandler> StageRunner for StageProcessor<H> {
    fn stage(&self) -> Stage {
        self.handler.stage()
    }

    fn run_batch(
        &self,
        limit: usize,
        concurrency: usize,
        cancel: &CancelToken,
    ) -> Result<BatchSummary, PipelineError> {
        let stage = self.handler.stage();
        let units = self
            .handler
            .select(self.store.as_ref(), limit)
            .map_err(|e| self.abort(e))?;
        // Nothing redelivers a storage-driven unit
        let final_attempt = vec![true; units.len()];
        let (outcome, writes) = self.execute(&units, &final_attempt, concurrency, cancel)?;
        Ok(self.finish(BatchSummary::from_outcome(stage, &outcome, writes)))
    }

    fn run_queue_batch(
        &self,
        queue: &dyn JobQueue,
        worker: &WorkerId,
        limit: usize,
        cancel: &CancelToken,
    ) -> Result<BatchSummary, PipelineError> {
        let stage = self.handler.stage();
        if queue.stage() != stage {
            return Err(PipelineError::InvalidRequest(format!(
                "the {} processor cannot drain the {} queue",
                stage,
                queue.stage()
            )));
        }

        let jobs = queue.lease(worker, limit)?;
        if jobs.is_empty() {
            return Ok(BatchSummary::empty(stage));
        }

        let resolved = match self.handler.resolve(self.store.as_ref(), &jobs) {
            Ok(resolved) => resolved,
            Err(e) => {
                self.release_all(queue, worker, &jobs);
                return Err(self.abort(e));
            }
        };

        let mut units = Vec::new();
        let mut final_attempt = Vec::new();
        let plan: Vec<Settlement> = resolved
            .into_iter()
            .zip(&jobs)
            .map(|(unit, job)| match unit {
                JobUnit::Ready(unit) => {
                    units.push(unit);
                    final_attempt.push(job.attempts >= job.max_attempts);
                    Settlement::Run(units.len() - 1)
                }
                JobUnit::AlreadyDone => Settlement::Complete,
                JobUnit::Missing(reason) => Settlement::Fail(reason),
            })
            .collect();

        let concurrency = queue.settings().concurrency;
        let (outcome, writes) = match self.execute(&units, &final_attempt, concurrency, cancel) {
            Ok(result) => result,
            Err(e) => {
                self.release_all(queue, worker, &jobs);
                return Err(e);
            }
        };

        let mut summary = BatchSummary {
            total: jobs.len(),
            writes,
            ..BatchSummary::empty(stage)
        };
        let (mut completed, mut retrying, mut failed, mut released) = (0, 0, 0, 0);

        for (job, settlement) in jobs.iter().zip(plan) {
            match settlement {
                Settlement::Complete => {
                    if acknowledged(job, queue.complete(job.id, worker))?.is_some() {
                        completed += 1;
                    }
                    summary.skipped += 1;
                }
                Settlement::Fail(reason) => {
                    tracing::warn!("Job {} cannot run: {}", job.id, reason);
                    if acknowledged(job, queue.fail(job.id, worker, &reason, false))?.is_some() {
                        failed += 1;
                    }
                    summary.failed += 1;
                }
                Settlement::Run(index) => match &outcome.slots[index] {
                    ItemOutcome::Done => {
                        if acknowledged(job, queue.complete(job.id, worker))?.is_some() {
                            completed += 1;
                        }
                        summary.processed += 1;
                    }
                    ItemOutcome::Failed { message, retryable } => {
                        match acknowledged(job, queue.fail(job.id, worker, message, *retryable))? {
                            Some(FailDisposition::Retrying { .. }) => retrying += 1,
                            Some(FailDisposition::Failed) => failed += 1,
                            None => {}
                        }
                        summary.failed += 1;
                    }
                    ItemOutcome::Skipped => {
                        if acknowledged(job, queue.release(job.id, worker))?.is_some() {
                            released += 1;
                        }
                        summary.skipped += 1;
                    }
                },
            }
        }

        self.events.send(QueueEvent::Settled {
            stage,
            completed,
            retrying,
            failed,
            released,
        });
        Ok(self.finish(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::media::{MediaId, MediaItem, StageStatus};
    use crate::core::queue::{JobPayload, MemoryJobQueue, QueueSettings};
    use crate::core::storage::MemoryStore;
    use crate::error::ItemError;

    /// Fails items whose file name starts with "bad", transiently for "flaky"
    struct ScriptedHandler;

    impl StageHandler for ScriptedHandler {
        type Unit = MediaItem;
        type Context = ();

        fn stage(&self) -> Stage {
            Stage::Exif
        }

        fn select(
            &self,
            store: &dyn MediaStore,
            limit: usize,
        ) -> Result<Vec<MediaItem>, PersistenceError> {
            super::super::select_media(store, Stage::Exif, limit)
        }

        fn resolve(
            &self,
            store: &dyn MediaStore,
            jobs: &[Job],
        ) -> Result<Vec<JobUnit<MediaItem>>, PersistenceError> {
            super::super::resolve_media(store, Stage::Exif, jobs)
        }

        fn begin_batch(&self, _: &dyn MediaStore, _: &[MediaItem]) -> Result<(), PersistenceError> {
            Ok(())
        }

        fn process(&self, item: &MediaItem, _: &()) -> Result<UpsertBatch, ItemError> {
            if item.file_name().starts_with("bad") {
                return Err(ItemError::MissingInput(item.file_name().to_string()));
            }
            if item.file_name().starts_with("flaky") {
                return Err(crate::error::ExtractionError::Io {
                    path: item.path.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::Interrupted, "busy"),
                }
                .into());
            }
            Ok(UpsertBatch::default())
        }

        fn media_id(&self, item: &MediaItem) -> Option<MediaId> {
            Some(item.id)
        }
    }

    fn store_with(names: &[&str]) -> Arc<MemoryStore> {
        Arc::new(MemoryStore::with_items(
            names
                .iter()
                .map(|name| MediaItem::new(format!("/p/{}", name), 1))
                .collect::<Vec<_>>(),
        ))
    }

    #[test]
    fn batch_persists_with_one_grouped_write() {
        let store = store_with(&["a.jpg", "bad.jpg", "flaky.jpg", "b.jpg"]);
        let processor = StageProcessor::new(ScriptedHandler, store.clone());

        let summary = processor.run_batch(10, 4, &CancelToken::new()).unwrap();

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.writes, 1);
        assert_eq!(store.writes(), 1);

        let statuses: Vec<_> = store
            .items()
            .unwrap()
            .iter()
            .map(|item| (item.file_name().to_string(), item.status(Stage::Exif)))
            .collect();
        assert!(statuses.contains(&("bad.jpg".to_string(), StageStatus::Failed)));
        assert!(statuses.contains(&("flaky.jpg".to_string(), StageStatus::Failed)));
        assert!(statuses.contains(&("a.jpg".to_string(), StageStatus::Done)));
    }

    #[test]
    fn failing_head_items_do_not_starve_the_rest() {
        let store = store_with(&["flaky.jpg", "a.jpg"]);
        let processor = StageProcessor::new(ScriptedHandler, store.clone());
        let cancel = CancelToken::new();

        let first = processor.run_batch(1, 1, &cancel).unwrap();
        assert_eq!((first.processed, first.failed), (0, 1));
        let second = processor.run_batch(1, 1, &cancel).unwrap();
        assert_eq!((second.processed, second.failed), (1, 0));
        assert!(store.find_eligible(Stage::Exif, 10).unwrap().is_empty());
    }

    #[test]
    fn last_attempt_marks_the_item_failed() {
        let store = store_with(&["flaky.jpg"]);
        let queue = MemoryJobQueue::new(
            Stage::Exif,
            QueueSettings {
                max_attempts: 1,
                ..QueueSettings::default()
            },
        );
        assert_eq!(crate::core::stage::enqueue_eligible(store.as_ref(), &queue, 10).unwrap(), 1);

        let processor = StageProcessor::new(ScriptedHandler, store.clone());
        let summary = processor
            .run_queue_batch(&queue, &WorkerId::new("w"), 10, &CancelToken::new())
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(queue.counts().unwrap().failed, 1);
        let items = store.items().unwrap();
        assert_eq!(items[0].status(Stage::Exif), StageStatus::Failed);
        assert_eq!(crate::core::stage::enqueue_eligible(store.as_ref(), &queue, 10).unwrap(), 0);
        assert_eq!(queue.counts().unwrap().waiting, 0);
    }

    #[test]
    fn cancelled_batch_skips_everything() {
        let store = store_with(&["a.jpg", "b.jpg"]);
        let processor = StageProcessor::new(ScriptedHandler, store.clone());
        let cancel = CancelToken::new();
        cancel.cancel();

        let summary = processor.run_batch(10, 2, &cancel).unwrap();

        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.writes, 0);
        assert_eq!(store.writes(), 0);
    }

    #[test]
    fn queue_batch_rejects_other_stage_queue() {
        let store = store_with(&["a.jpg"]);
        let processor = StageProcessor::new(ScriptedHandler, store);
        let queue = MemoryJobQueue::new(Stage::Hash, QueueSettings::default());

        let result = processor.run_queue_batch(&queue, &WorkerId::new("w"), 5, &CancelToken::new());
        assert!(matches!(result, Err(PipelineError::InvalidRequest(_))));
    }

    #[test]
    fn queue_batch_settles_every_job() {
        let store = store_with(&["a.jpg", "bad.jpg", "flaky.jpg"]);
        let queue = MemoryJobQueue::new(Stage::Exif, QueueSettings::default());
        let payloads = store
            .items()
            .unwrap()
            .iter()
            .filter_map(|item| JobPayload::for_item(Stage::Exif, item))
            .collect();
        queue.enqueue(payloads).unwrap();

        let processor = StageProcessor::new(ScriptedHandler, store.clone());
        let summary = processor
            .run_queue_batch(&queue, &WorkerId::new("w"), 10, &CancelToken::new())
            .unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 2);
        let counts = queue.counts().unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.delayed, 1);
        assert_eq!(counts.active, 0);
        let flaky = store
            .items()
            .unwrap()
            .into_iter()
            .find(|item| item.file_name() == "flaky.jpg")
            .unwrap();
        assert_eq!(flaky.status(Stage::Exif), StageStatus::Pending);
    }

    #[test]
    fn persistence_failure_releases_leased_jobs() {
        let store = store_with(&["a.jpg", "b.jpg"]);
        let queue = MemoryJobQueue::new(Stage::Exif, QueueSettings::default());
        let payloads = store
            .items()
            .unwrap()
            .iter()
            .filter_map(|item| JobPayload::for_item(Stage::Exif, item))
            .collect();
        queue.enqueue(payloads).unwrap();
        store.fail_writes("disk full");

        let processor = StageProcessor::new(ScriptedHandler, store.clone());
        let result = processor.run_queue_batch(&queue, &WorkerId::new("w"), 10, &CancelToken::new());

        assert!(matches!(result, Err(PipelineError::Persistence(_))));
        let counts = queue.counts().unwrap();
        assert_eq!(counts.waiting, 2);
        assert_eq!(counts.active, 0);
        assert!(store
            .items()
            .unwrap()
            .iter()
            .all(|item| item.status(Stage::Exif) == StageStatus::Pending));
    }
}
