//! # Worker Module
//!
//! Long-running queue consumer for one stage.
//!
//! ## Loop
//! 1. Lease and process one batch through [`StageRunner::run_queue_batch`]
//! 2. When the batch settled items, enqueue what became eligible for the
//!    next stage
//! 3. When nothing could be leased, stop (`until_idle`) or sleep for the
//!    poll interval
//!
//! Cancellation is cooperative: the token is checked before every item and
//! between batches, and work already done is persisted as usual.

use crate::core::queue::{JobQueue, WorkerId};
use crate::core::stage::{enqueue_eligible, BatchSummary, StageRunner};
use crate::core::storage::MediaStore;
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Totals over every batch a worker ran
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub batches: usize,
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Jobs handed to the next stage's queue
    pub forwarded: usize,
}

impl WorkerReport {
    fn add(&mut self, summary: &BatchSummary) {
        self.batches += 1;
        self.processed += summary.processed;
        self.failed += summary.failed;
        self.skipped += summary.skipped;
    }
}

pub struct QueueWorker {
    id: WorkerId,
    runner: Box<dyn StageRunner>,
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn MediaStore>,
    downstream: Option<Arc<dyn JobQueue>>,
    batch_size: usize,
    poll_interval: Duration,
    until_idle: bool,
}

impl QueueWorker {
    pub fn new(
        runner: Box<dyn StageRunner>,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn MediaStore>,
    ) -> Result<Self, PipelineError> {
        if runner.stage() != queue.stage() {
            return Err(PipelineError::InvalidRequest(format!(
                "a {} runner cannot consume the {} queue",
                runner.stage(),
                queue.stage()
            )));
        }
        let id = WorkerId::generate(queue.stage().as_str());
        Ok(Self {
            id,
            runner,
            queue,
            store,
            downstream: None,
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            until_idle: false,
        })
    }

    /// Queue fed with items that become eligible after each batch
    pub fn with_downstream(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.downstream = Some(queue);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Return once nothing can be leased instead of polling forever
    pub fn until_idle(mut self, until_idle: bool) -> Self {
        self.until_idle = until_idle;
        self
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn run(&self, cancel: &CancelToken) -> Result<WorkerReport, PipelineError> {
        let mut report = WorkerReport::default();
        tracing::info!("Worker {} started on the {} queue", self.id, self.queue.stage());

        while !cancel.is_cancelled() {
            let summary =
                self.runner
                    .run_queue_batch(self.queue.as_ref(), &self.id, self.batch_size, cancel)?;

            if summary.total == 0 {
                if self.until_idle {
                    break;
                }
                std::thread::sleep(self.poll_interval);
                continue;
            }

            report.add(&summary);
            if summary.processed > 0 {
                if let Some(downstream) = &self.downstream {
                    report.forwarded +=
                        enqueue_eligible(self.store.as_ref(), downstream.as_ref(), self.batch_size)?;
                }
            }
        }

        tracing::info!(
            "Worker {} stopped after {} batches ({} processed, {} failed)",
            self.id,
            report.batches,
            report.processed,
            report.failed
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::media::{MediaItem, Stage};
    use crate::core::queue::{MemoryJobQueue, QueueSettings};
    use crate::core::stage::{ExifHandler, StageProcessor};
    use crate::core::storage::MemoryStore;

    #[test]
    fn token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn rejects_mismatched_queue() {
        let store: Arc<dyn MediaStore> = Arc::new(MemoryStore::new());
        let runner = Box::new(StageProcessor::new(ExifHandler::default(), store.clone()));
        let queue = Arc::new(MemoryJobQueue::new(Stage::Hash, QueueSettings::default()));
        assert!(QueueWorker::new(runner, queue, store).is_err());
    }

    #[test]
    fn cancelled_worker_runs_no_batches() {
        let store: Arc<dyn MediaStore> = Arc::new(MemoryStore::with_items(vec![MediaItem::new(
            "/p/a.jpg",
            1,
        )]));
        let queue: Arc<dyn JobQueue> =
            Arc::new(MemoryJobQueue::new(Stage::Exif, QueueSettings::default()));
        enqueue_eligible(store.as_ref(), queue.as_ref(), 10).unwrap();

        let runner = Box::new(StageProcessor::new(ExifHandler::default(), store.clone()));
        let worker = QueueWorker::new(runner, queue.clone(), store).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = worker.run(&cancel).unwrap();
        assert_eq!(report.batches, 0);
        assert_eq!(queue.counts().unwrap().waiting, 1);
    }

    #[test]
    fn idle_worker_drains_and_forwards() {
        // Missing files fail with a retryable read error; max_attempts 1 makes it final
        let store: Arc<dyn MediaStore> = Arc::new(MemoryStore::with_items(vec![MediaItem::new(
            "/definitely/missing.jpg",
            1,
        )]));
        let settings = QueueSettings {
            max_attempts: 1,
            ..QueueSettings::default()
        };
        let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new(Stage::Exif, settings));
        let next: Arc<dyn JobQueue> =
            Arc::new(MemoryJobQueue::new(Stage::Thumbnail, QueueSettings::default()));
        enqueue_eligible(store.as_ref(), queue.as_ref(), 10).unwrap();

        let runner = Box::new(StageProcessor::new(ExifHandler::default(), store.clone()));
        let worker = QueueWorker::new(runner, queue.clone(), store)
            .unwrap()
            .with_downstream(next.clone())
            .until_idle(true);

        let report = worker.run(&CancelToken::new()).unwrap();
        assert_eq!(report.batches, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.forwarded, 0);
        assert_eq!(queue.counts().unwrap().failed, 1);
        assert_eq!(next.counts().unwrap().total(), 0);
    }
}
