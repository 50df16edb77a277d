//! # Stage Module
//!
//! Drives one pipeline stage over a batch of work units.
//!
//! ## Batch Contract
//! 1. Units come from the store (`run_batch`) or from leased jobs
//!    (`run_queue_batch`)
//! 2. Each unit is processed independently on a rayon pool and owns one slot
//!    of the [`BatchOutcome`]; a failing unit never affects its siblings
//! 3. All rows and all terminal statuses are written with one
//!    `persist_batch` call, a single store transaction
//! 4. A transient failure leaves the item pending while its job still has
//!    attempts left; definitive failures, and transient ones on the last
//!    attempt, are recorded as `Failed`. Storage-driven batches have no
//!    redelivery, so every failure there is final.
//!
//! If the grouped write fails the batch is aborted; in queue mode every
//! leased job is released untouched.

mod analysis;
mod dedup;
mod exif;
mod hash;
mod processor;
mod scan;
mod thumbnail;

pub use analysis::AnalysisHandler;
pub use dedup::DedupHandler;
pub use exif::ExifHandler;
pub use hash::HashHandler;
pub use processor::StageProcessor;
pub use scan::ScanHandler;
pub use thumbnail::ThumbnailHandler;

use crate::core::media::{MediaId, MediaItem, Stage, StageStatus, UpsertBatch};
use crate::core::queue::{Job, JobPayload, JobQueue, WorkerId};
use crate::core::storage::MediaStore;
use crate::core::worker::CancelToken;
use crate::error::{ItemError, PersistenceError, PipelineError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What a stage does to one unit of work
pub trait StageHandler: Send + Sync + 'static {
    /// A media item for per-item stages, a folder for the scan stage
    type Unit: Send + Sync;
    /// Read-only input shared by every unit of a batch
    type Context: Send + Sync;

    fn stage(&self) -> Stage;

    /// Pick up to `limit` units straight from the store
    fn select(&self, store: &dyn MediaStore, limit: usize)
        -> Result<Vec<Self::Unit>, PersistenceError>;

    /// Map leased jobs to units, one entry per job
    fn resolve(
        &self,
        store: &dyn MediaStore,
        jobs: &[Job],
    ) -> Result<Vec<JobUnit<Self::Unit>>, PersistenceError>;

    /// Load the batch context before fan-out
    fn begin_batch(
        &self,
        store: &dyn MediaStore,
        units: &[Self::Unit],
    ) -> Result<Self::Context, PersistenceError>;

    /// Produce the rows for one unit
    fn process(&self, unit: &Self::Unit, context: &Self::Context)
        -> Result<UpsertBatch, ItemError>;

    /// Item whose status this unit settles, if any
    fn media_id(&self, unit: &Self::Unit) -> Option<MediaId>;
}

/// A leased job after lookup
#[derive(Debug)]
pub enum JobUnit<U> {
    Ready(U),
    /// Nothing left to do; the job is acknowledged as complete
    AlreadyDone,
    /// The job cannot be run; it fails without retry
    Missing(String),
}

/// Result of one slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemOutcome {
    Done,
    Failed { message: String, retryable: bool },
    /// Not started because the batch was cancelled
    Skipped,
}

/// Per-slot results, index-aligned with the batch's units
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub slots: Vec<ItemOutcome>,
}

impl BatchOutcome {
    fn count(&self, f: impl Fn(&ItemOutcome) -> bool) -> usize {
        self.slots.iter().filter(|slot| f(slot)).count()
    }
}

/// Counters of one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub stage: Stage,
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total: usize,
    /// Grouped store writes made (0 or 1)
    pub writes: usize,
}

impl BatchSummary {
    pub fn empty(stage: Stage) -> Self {
        Self {
            stage,
            processed: 0,
            failed: 0,
            skipped: 0,
            total: 0,
            writes: 0,
        }
    }

    fn from_outcome(stage: Stage, outcome: &BatchOutcome, writes: usize) -> Self {
        Self {
            stage,
            processed: outcome.count(|s| *s == ItemOutcome::Done),
            failed: outcome.count(|s| matches!(s, ItemOutcome::Failed { .. })),
            skipped: outcome.count(|s| *s == ItemOutcome::Skipped),
            total: outcome.slots.len(),
            writes,
        }
    }
}

/// Type-erased stage driver, one per stage
pub trait StageRunner: Send + Sync {
    fn stage(&self) -> Stage;

    /// Process up to `limit` eligible units selected from the store
    fn run_batch(
        &self,
        limit: usize,
        concurrency: usize,
        cancel: &CancelToken,
    ) -> Result<BatchSummary, PipelineError>;

    /// Lease up to `limit` jobs, process them, persist, then acknowledge
    fn run_queue_batch(
        &self,
        queue: &dyn JobQueue,
        worker: &WorkerId,
        limit: usize,
        cancel: &CancelToken,
    ) -> Result<BatchSummary, PipelineError>;
}

/// Enqueue a job for up to `limit` items eligible for the queue's stage.
///
/// Items with unfinished jobs are collapsed by the queue, so calling this
/// repeatedly is safe. Returns the number of job ids handed back.
pub fn enqueue_eligible(
    store: &dyn MediaStore,
    queue: &dyn JobQueue,
    limit: usize,
) -> Result<usize, PipelineError> {
    let stage = queue.stage();
    let payloads: Vec<JobPayload> = store
        .find_eligible(stage, limit)?
        .iter()
        .filter_map(|item| JobPayload::for_item(stage, item))
        .collect();
    if payloads.is_empty() {
        return Ok(0);
    }
    let ids = queue.enqueue(payloads)?;
    tracing::debug!("Enqueued {} {} jobs", ids.len(), stage);
    Ok(ids.len())
}

/// Eligible items, for the per-item handlers
fn select_media(
    store: &dyn MediaStore,
    stage: Stage,
    limit: usize,
) -> Result<Vec<MediaItem>, PersistenceError> {
    store.find_eligible(stage, limit)
}

/// Look up the items of `jobs` with one store call
fn resolve_media(
    store: &dyn MediaStore,
    stage: Stage,
    jobs: &[Job],
) -> Result<Vec<JobUnit<MediaItem>>, PersistenceError> {
    let ids: Vec<MediaId> = jobs.iter().filter_map(|j| j.payload.media_id()).collect();
    let items: HashMap<MediaId, MediaItem> = store
        .find_by_ids(&ids)?
        .into_iter()
        .map(|item| (item.id, item))
        .collect();

    Ok(jobs
        .iter()
        .map(|job| {
            let Some(id) = job.payload.media_id() else {
                return JobUnit::Missing(format!("job {} carries no media item", job.id));
            };
            match items.get(&id) {
                None => JobUnit::Missing(format!("media item {} not found", id)),
                Some(item) if item.is_deleted || item.status(stage) != StageStatus::Pending => {
                    JobUnit::AlreadyDone
                }
                Some(item) => JobUnit::Ready(item.clone()),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::queue::{MemoryJobQueue, QueueSettings};
    use crate::core::storage::MemoryStore;

    #[test]
    fn enqueue_eligible_is_idempotent() {
        let store = MemoryStore::with_items(vec![
            MediaItem::new("/p/a.jpg", 10),
            MediaItem::new("/p/b.jpg", 10),
            MediaItem::new("/p/c.txt", 10),
        ]);
        let queue = MemoryJobQueue::new(Stage::Exif, QueueSettings::default());

        assert_eq!(enqueue_eligible(&store, &queue, 10).unwrap(), 2);
        assert_eq!(enqueue_eligible(&store, &queue, 10).unwrap(), 2);
        assert_eq!(queue.counts().unwrap().waiting, 2);
    }

    #[test]
    fn resolve_classifies_jobs() {
        let mut done = MediaItem::new("/p/done.jpg", 10);
        done.flags.set(Stage::Exif, StageStatus::Done);
        let pending = MediaItem::new("/p/pending.jpg", 10);
        let gone = MediaItem::new("/p/gone.jpg", 10);
        let store = MemoryStore::with_items(vec![done.clone(), pending.clone()]);

        let queue = MemoryJobQueue::new(Stage::Exif, QueueSettings::default());
        let payloads = [&done, &pending, &gone]
            .iter()
            .filter_map(|item| JobPayload::for_item(Stage::Exif, item))
            .collect();
        queue.enqueue(payloads).unwrap();
        let jobs = queue.lease(&WorkerId::new("w"), 3).unwrap();

        let units = resolve_media(&store, Stage::Exif, &jobs).unwrap();
        assert!(matches!(units[0], JobUnit::AlreadyDone));
        assert!(matches!(&units[1], JobUnit::Ready(item) if item.id == pending.id));
        assert!(matches!(units[2], JobUnit::Missing(_)));
    }
}
