//! In-memory store for tests and dry runs.
//!
//! Writes are applied to a copy of the state that replaces the original only
//! when the whole call succeeded.

use super::{MediaStore, PersistedBatch};
use crate::core::fingerprint::Fingerprint;
use crate::core::media::{
    DuplicatePair, MediaCategory, MediaId, MediaItem, Resolution, Stage, StatusUpdate,
    UpsertBatch,
};
use crate::error::PersistenceError;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Clone, Default)]
struct StoreState {
    /// Discovery order; items are soft-deleted, never removed
    items: Vec<MediaItem>,
    index: HashMap<MediaId, usize>,
    by_path: HashMap<PathBuf, MediaId>,
    pairs: BTreeMap<(MediaId, MediaId), DuplicatePair>,
}

impl StoreState {
    fn item_mut(&mut self, id: MediaId) -> Option<&mut MediaItem> {
        let position = *self.index.get(&id)?;
        self.items.get_mut(position)
    }

    fn insert(&mut self, item: MediaItem) -> bool {
        if self.by_path.contains_key(&item.path) || self.index.contains_key(&item.id) {
            return false;
        }
        self.by_path.insert(item.path.clone(), item.id);
        self.index.insert(item.id, self.items.len());
        self.items.push(item);
        true
    }

    fn upsert(&mut self, batch: &UpsertBatch) -> usize {
        let mut written = 0;
        for media in &batch.media {
            let mut item = MediaItem::new(media.path.clone(), media.size_bytes).with_id(media.id);
            item.category = media.category;
            if self.insert(item) {
                written += 1;
            }
        }
        for record in &batch.exif {
            if let Some(item) = self.item_mut(record.media_id) {
                item.exif = Some(record.data.clone());
                written += 1;
            }
        }
        for record in &batch.thumbnails {
            if let Some(item) = self.item_mut(record.media_id) {
                item.thumbnail_path = Some(record.thumbnail_path.clone());
                item.file_hash = Some(record.file_hash.clone());
                written += 1;
            }
        }
        for record in &batch.fingerprints {
            if let Some(item) = self.item_mut(record.media_id) {
                item.fingerprint = Some(record.fingerprint.clone());
                written += 1;
            }
        }
        for record in &batch.analysis {
            if let Some(item) = self.item_mut(record.media_id) {
                item.analysis = Some(record.data);
                written += 1;
            }
        }
        for pair in &batch.duplicates {
            self.pairs.insert(pair.key(), pair.clone());
            written += 1;
        }
        written
    }

    fn update_statuses(&mut self, stage: Stage, updates: &[StatusUpdate]) -> usize {
        let mut updated = 0;
        for update in updates {
            if let Some(item) = self.item_mut(update.id) {
                item.flags.set(stage, update.status);
                updated += 1;
            }
        }
        updated
    }
}

/// Mutex-guarded store that counts its write calls
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    writes: AtomicUsize,
    failure: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-filled with `items`; seeding is not counted as a write
    pub fn with_items(items: impl IntoIterator<Item = MediaItem>) -> Self {
        let mut state = StoreState::default();
        for item in items {
            state.insert(item);
        }
        Self {
            state: Mutex::new(state),
            ..Self::default()
        }
    }

    /// Write calls made so far, failed ones included
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every following write call fail with `reason`
    pub fn fail_writes(&self, reason: impl Into<String>) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = Some(reason.into());
        }
    }

    pub fn clear_failure(&self) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = None;
        }
    }

    /// Snapshot of every stored item
    pub fn items(&self) -> Result<Vec<MediaItem>, PersistenceError> {
        Ok(self.lock()?.items.clone())
    }

    pub fn get(&self, id: MediaId) -> Result<Option<MediaItem>, PersistenceError> {
        let state = self.lock()?;
        Ok(state.index.get(&id).map(|&i| state.items[i].clone()))
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, PersistenceError> {
        self.state.lock().map_err(|_| PersistenceError::LockPoisoned)
    }

    /// Count the call, honour an injected failure, then apply `f` to a copy
    /// and commit it
    fn write<T>(
        &self,
        f: impl FnOnce(&mut StoreState) -> T,
    ) -> Result<T, PersistenceError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .failure
            .lock()
            .map_err(|_| PersistenceError::LockPoisoned)?
            .clone();
        if let Some(reason) = injected {
            return Err(PersistenceError::Injected(reason));
        }

        let mut state = self.lock()?;
        let mut next = state.clone();
        let value = f(&mut next);
        *state = next;
        Ok(value)
    }
}

impl MediaStore for MemoryStore {
    fn find_eligible(&self, stage: Stage, limit: usize) -> Result<Vec<MediaItem>, PersistenceError> {
        let state = self.lock()?;
        Ok(state
            .items
            .iter()
            .filter(|item| item.is_eligible_for(stage))
            .take(limit)
            .cloned()
            .collect())
    }

    fn find_by_ids(&self, ids: &[MediaId]) -> Result<Vec<MediaItem>, PersistenceError> {
        let state = self.lock()?;
        Ok(ids
            .iter()
            .filter_map(|id| state.index.get(id))
            .map(|&i| state.items[i].clone())
            .collect())
    }

    fn fingerprinted(
        &self,
        category: MediaCategory,
    ) -> Result<Vec<(MediaId, Fingerprint)>, PersistenceError> {
        let state = self.lock()?;
        Ok(state
            .items
            .iter()
            .filter(|item| !item.is_deleted && item.category == category)
            .filter_map(|item| item.fingerprint.clone().map(|fp| (item.id, fp)))
            .collect())
    }

    fn duplicate_pairs(&self) -> Result<Vec<DuplicatePair>, PersistenceError> {
        Ok(self.lock()?.pairs.values().cloned().collect())
    }

    fn batch_upsert(&self, batch: &UpsertBatch) -> Result<usize, PersistenceError> {
        self.write(|state| state.upsert(batch))
    }

    fn batch_update_status(
        &self,
        stage: Stage,
        updates: &[StatusUpdate],
    ) -> Result<usize, PersistenceError> {
        self.write(|state| state.update_statuses(stage, updates))
    }

    fn persist_batch(
        &self,
        stage: Stage,
        batch: &UpsertBatch,
        updates: &[StatusUpdate],
    ) -> Result<PersistedBatch, PersistenceError> {
        self.write(|state| PersistedBatch {
            rows: state.upsert(batch),
            statuses: state.update_statuses(stage, updates),
        })
    }

    fn resolve_duplicates(&self, resolutions: &[Resolution]) -> Result<usize, PersistenceError> {
        self.write(|state| {
            let mut discarded = 0;
            for resolution in resolutions {
                if let Some(item) = state.item_mut(resolution.discard) {
                    if !item.is_deleted {
                        item.is_deleted = true;
                        discarded += 1;
                    }
                }
                state.pairs.retain(|_, pair| !pair.involves(resolution.discard));
            }
            discarded
        })
    }

    fn count(&self) -> Result<usize, PersistenceError> {
        Ok(self.lock()?.items.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::media::{ExifData, ExifRecord, NewMedia, StageStatus};

    fn new_media(n: u128, path: &str) -> NewMedia {
        NewMedia {
            id: MediaId::from_u128(n),
            path: PathBuf::from(path),
            size_bytes: 100,
            category: MediaCategory::from_path(std::path::Path::new(path)),
        }
    }

    #[test]
    fn injected_failure_leaves_state_untouched() {
        let store = MemoryStore::new();
        store.fail_writes("disk full");

        let batch = UpsertBatch {
            media: vec![new_media(1, "/a.jpg")],
            ..UpsertBatch::default()
        };
        assert!(matches!(
            store.batch_upsert(&batch),
            Err(PersistenceError::Injected(_))
        ));
        assert_eq!(store.count().unwrap(), 0);
        assert_eq!(store.writes(), 1);

        store.clear_failure();
        assert_eq!(store.batch_upsert(&batch).unwrap(), 1);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn media_upsert_keeps_existing_rows() {
        let store = MemoryStore::new();
        let first = UpsertBatch {
            media: vec![new_media(1, "/a.jpg")],
            ..UpsertBatch::default()
        };
        store.batch_upsert(&first).unwrap();
        store
            .batch_update_status(Stage::Exif, &[StatusUpdate::done(MediaId::from_u128(1))])
            .unwrap();

        let again = UpsertBatch {
            media: vec![new_media(2, "/a.jpg")],
            ..UpsertBatch::default()
        };
        assert_eq!(store.batch_upsert(&again).unwrap(), 0);

        let items = store.items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, MediaId::from_u128(1));
        assert_eq!(items[0].status(Stage::Exif), StageStatus::Done);
    }

    #[test]
    fn records_for_unknown_items_are_ignored() {
        let store = MemoryStore::new();
        let batch = UpsertBatch {
            exif: vec![ExifRecord {
                media_id: MediaId::from_u128(99),
                data: ExifData::default(),
            }],
            ..UpsertBatch::default()
        };
        assert_eq!(store.batch_upsert(&batch).unwrap(), 0);
    }
}
