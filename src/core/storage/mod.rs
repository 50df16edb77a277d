//! # Storage Module
//!
//! Persistence of media items, stage results and duplicate pairs.
//!
//! ## Grouped Writes
//! Stages never write row by row. A batch hands the store one
//! [`UpsertBatch`] and one list of [`StatusUpdate`]s through
//! [`MediaStore::persist_batch`], a single all-or-nothing call: on error
//! neither the rows nor the statuses are visible.
//!
//! ## Backends
//! - `SqliteStore` - file-backed, WAL mode, one transaction per call
//! - `MemoryStore` - for tests; counts write calls and can be told to fail

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::core::fingerprint::Fingerprint;
use crate::core::media::{
    DuplicatePair, MediaCategory, MediaId, MediaItem, Resolution, Stage, StatusUpdate,
    UpsertBatch,
};
use crate::error::PersistenceError;

/// Row counts of one [`MediaStore::persist_batch`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistedBatch {
    pub rows: usize,
    pub statuses: usize,
}

/// Media item persistence used by every stage
pub trait MediaStore: Send + Sync {
    /// Up to `limit` items eligible for `stage`, in discovery order
    ///
    /// An item is eligible when it is not deleted, its category is handled by
    /// the stage, its own status is pending and the previous stage is done.
    fn find_eligible(&self, stage: Stage, limit: usize) -> Result<Vec<MediaItem>, PersistenceError>;

    /// Items with the given ids; unknown ids are left out
    fn find_by_ids(&self, ids: &[MediaId]) -> Result<Vec<MediaItem>, PersistenceError>;

    /// Live items of `category` that already have a fingerprint
    fn fingerprinted(
        &self,
        category: MediaCategory,
    ) -> Result<Vec<(MediaId, Fingerprint)>, PersistenceError>;

    fn duplicate_pairs(&self) -> Result<Vec<DuplicatePair>, PersistenceError>;

    /// Write every row of `batch` in one call. Returns the rows written.
    fn batch_upsert(&self, batch: &UpsertBatch) -> Result<usize, PersistenceError>;

    /// Record the outcome of `stage` for each item in one call
    fn batch_update_status(
        &self,
        stage: Stage,
        updates: &[StatusUpdate],
    ) -> Result<usize, PersistenceError>;

    /// Write the rows of `batch` and the `stage` outcomes in one
    /// transaction
    fn persist_batch(
        &self,
        stage: Stage,
        batch: &UpsertBatch,
        updates: &[StatusUpdate],
    ) -> Result<PersistedBatch, PersistenceError>;

    /// Soft-delete every discarded item and drop the pairs that touch it
    fn resolve_duplicates(&self, resolutions: &[Resolution]) -> Result<usize, PersistenceError>;

    /// Number of stored items, deleted ones included
    fn count(&self) -> Result<usize, PersistenceError>;
}

/// Categories a stage handles, in declaration order
fn applicable_categories(stage: Stage) -> Vec<MediaCategory> {
    [
        MediaCategory::Image,
        MediaCategory::Raw,
        MediaCategory::Video,
        MediaCategory::Other,
    ]
    .into_iter()
    .filter(|c| !c.is_ignored() && stage.applies_to(*c))
    .collect()
}
