//! SQLite media store.
//!
//! Uses WAL mode so readers proceed while a batch is being written. Every
//! trait call that writes runs in a single transaction.

use super::{applicable_categories, MediaStore, PersistedBatch};
use crate::core::fingerprint::Fingerprint;
use crate::core::media::{
    AnalysisData, DuplicatePair, ExifData, MediaCategory, MediaId, MediaItem, Resolution, Stage,
    StageFlags, StageStatus, StatusUpdate, UpsertBatch,
};
use crate::error::PersistenceError;
use rusqlite::{params, params_from_iter, Connection, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const MEDIA_COLUMNS: &str = "id, path, size_bytes, category, fingerprint, is_deleted, exif, \
     thumbnail_path, file_hash, analysis, examined, thumbnailed, hashed, dedup_checked, analyzed";

/// SQLite-backed media store
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open or create a media database at the given path
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PersistenceError::OpenFailed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        }

        let conn = Connection::open(path).map_err(|e| PersistenceError::OpenFailed {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        Self::init(conn, path.to_path_buf())
    }

    /// Private in-memory database
    pub fn in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, PathBuf::from(":memory:"))
    }

    fn init(conn: Connection, db_path: PathBuf) -> Result<Self, PersistenceError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS media (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL UNIQUE,
                size_bytes INTEGER NOT NULL,
                category TEXT NOT NULL,
                fingerprint TEXT,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                exif TEXT,
                thumbnail_path TEXT,
                file_hash TEXT,
                analysis TEXT,
                examined TEXT NOT NULL DEFAULT 'pending',
                thumbnailed TEXT NOT NULL DEFAULT 'pending',
                hashed TEXT NOT NULL DEFAULT 'pending',
                dedup_checked TEXT NOT NULL DEFAULT 'pending',
                analyzed TEXT NOT NULL DEFAULT 'pending'
            );
            CREATE INDEX IF NOT EXISTS idx_media_category ON media(category, is_deleted);
            CREATE TABLE IF NOT EXISTS duplicates (
                media_id TEXT NOT NULL,
                duplicate_id TEXT NOT NULL,
                hamming_distance INTEGER NOT NULL,
                similarity_score REAL NOT NULL,
                PRIMARY KEY (media_id, duplicate_id)
            );
            CREATE INDEX IF NOT EXISTS idx_duplicates_other ON duplicates(duplicate_id);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, PersistenceError> {
        self.conn.lock().map_err(|_| PersistenceError::LockPoisoned)
    }

    fn select_media(
        conn: &Connection,
        filter: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<MediaItem>, PersistenceError> {
        let sql = format!("SELECT {} FROM media WHERE {}", MEDIA_COLUMNS, filter);
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(params, MediaRow::read)?
            .map(|row| row.map_err(PersistenceError::from).and_then(MediaRow::into_item))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }
}

/// Column holding the status flag of a per-item stage

/// Every row of `batch`, inside the caller's transaction
fn upsert_rows(tx: &Connection, batch: &UpsertBatch) -> Result<usize, PersistenceError> {
    let mut written = 0;

    for media in &batch.media {
        written += tx.execute(
            "INSERT INTO media (id, path, size_bytes, category) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT DO NOTHING",
            params![
                media.id.to_string(),
                media.path.to_string_lossy(),
                media.size_bytes as i64,
                media.category.as_str(),
            ],
        )?;
    }
    for record in &batch.exif {
        written += tx.execute(
            "UPDATE media SET exif = ?2 WHERE id = ?1",
            params![record.media_id.to_string(), to_json(&record.data)?],
        )?;
    }
    for record in &batch.thumbnails {
        written += tx.execute(
            "UPDATE media SET thumbnail_path = ?2, file_hash = ?3 WHERE id = ?1",
            params![
                record.media_id.to_string(),
                record.thumbnail_path.to_string_lossy(),
                record.file_hash,
            ],
        )?;
    }
    for record in &batch.fingerprints {
        written += tx.execute(
            "UPDATE media SET fingerprint = ?2 WHERE id = ?1",
            params![record.media_id.to_string(), record.fingerprint.as_str()],
        )?;
    }
    for record in &batch.analysis {
        written += tx.execute(
            "UPDATE media SET analysis = ?2 WHERE id = ?1",
            params![record.media_id.to_string(), to_json(&record.data)?],
        )?;
    }
    for pair in &batch.duplicates {
        written += tx.execute(
            "INSERT INTO duplicates (media_id, duplicate_id, hamming_distance, similarity_score)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(media_id, duplicate_id) DO UPDATE SET
                hamming_distance = excluded.hamming_distance,
                similarity_score = excluded.similarity_score",
            params![
                pair.media_id().to_string(),
                pair.duplicate_id().to_string(),
                pair.hamming_distance(),
                pair.similarity_score(),
            ],
        )?;
    }
    Ok(written)
}

/// Status column writes for `stage`, inside the caller's transaction
fn update_statuses(
    tx: &Connection,
    stage: Stage,
    updates: &[StatusUpdate],
) -> Result<usize, PersistenceError> {
    let Some(column) = status_column(stage) else {
        return Ok(0);
    };
    let mut stmt = tx.prepare(&format!("UPDATE media SET {} = ?2 WHERE id = ?1", column))?;
    let mut updated = 0;
    for update in updates {
        updated += stmt.execute(params![update.id.to_string(), update.status.as_str()])?;
    }
    Ok(updated)
}

fn status_column(stage: Stage) -> Option<&'static str> {
    match stage {
        Stage::Scan => None,
        Stage::Exif => Some("examined"),
        Stage::Thumbnail => Some("thumbnailed"),
        Stage::Hash => Some("hashed"),
        Stage::Dedup => Some("dedup_checked"),
        Stage::Analysis => Some("analyzed"),
    }
}

impl MediaStore for SqliteStore {
    fn find_eligible(&self, stage: Stage, limit: usize) -> Result<Vec<MediaItem>, PersistenceError> {
        let Some(column) = status_column(stage) else {
            return Ok(Vec::new());
        };
        let categories = applicable_categories(stage);
        if categories.is_empty() {
            return Ok(Vec::new());
        }

        let category_list = categories
            .iter()
            .map(|c| format!("'{}'", c.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let prerequisite = match stage.prerequisite().and_then(status_column) {
            Some(previous) => format!(" AND {} = 'done'", previous),
            None => String::new(),
        };
        let filter = format!(
            "is_deleted = 0 AND category IN ({}) AND {} = 'pending'{} ORDER BY rowid LIMIT ?1",
            category_list, column, prerequisite
        );

        let conn = self.lock()?;
        Self::select_media(&conn, &filter, params![limit as i64])
    }

    fn find_by_ids(&self, ids: &[MediaId]) -> Result<Vec<MediaItem>, PersistenceError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let mut items = Vec::with_capacity(ids.len());
        // Chunked to stay under SQLite's bound-parameter limit
        for chunk in ids.chunks(500) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let filter = format!("id IN ({}) ORDER BY rowid", placeholders);
            items.extend(Self::select_media(
                &conn,
                &filter,
                params_from_iter(chunk.iter().map(|id| id.to_string())),
            )?);
        }
        Ok(items)
    }

    fn fingerprinted(
        &self,
        category: MediaCategory,
    ) -> Result<Vec<(MediaId, Fingerprint)>, PersistenceError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, fingerprint FROM media
             WHERE category = ?1 AND is_deleted = 0 AND fingerprint IS NOT NULL
             ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map(params![category.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, fp)| {
                let fingerprint = Fingerprint::parse(&fp)
                    .map_err(|e| PersistenceError::Corrupt(format!("fingerprint of {}: {}", id, e)))?;
                Ok((parse_media_id(&id)?, fingerprint))
            })
            .collect()
    }

    fn duplicate_pairs(&self) -> Result<Vec<DuplicatePair>, PersistenceError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT media_id, duplicate_id, hamming_distance, similarity_score
             FROM duplicates ORDER BY media_id, duplicate_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, f64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(media_id, duplicate_id, distance, score)| {
                Ok(DuplicatePair::from_stored(
                    parse_media_id(&media_id)?,
                    parse_media_id(&duplicate_id)?,
                    distance as u32,
                    score,
                ))
            })
            .collect()
    }

    fn batch_upsert(&self, batch: &UpsertBatch) -> Result<usize, PersistenceError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let written = upsert_rows(&tx, batch)?;
        tx.commit()?;
        tracing::debug!("Upserted {} rows into {}", written, self.db_path.display());
        Ok(written)
    }

    fn batch_update_status(
        &self,
        stage: Stage,
        updates: &[StatusUpdate],
    ) -> Result<usize, PersistenceError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = update_statuses(&tx, stage, updates)?;
        tx.commit()?;
        Ok(updated)
    }

    fn persist_batch(
        &self,
        stage: Stage,
        batch: &UpsertBatch,
        updates: &[StatusUpdate],
    ) -> Result<PersistedBatch, PersistenceError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let persisted = PersistedBatch {
            rows: upsert_rows(&tx, batch)?,
            statuses: update_statuses(&tx, stage, updates)?,
        };
        tx.commit()?;
        tracing::debug!(
            "{}: persisted {} rows and {} statuses into {}",
            stage,
            persisted.rows,
            persisted.statuses,
            self.db_path.display()
        );
        Ok(persisted)
    }

    fn resolve_duplicates(&self, resolutions: &[Resolution]) -> Result<usize, PersistenceError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut discarded = 0;
        for resolution in resolutions {
            let discard = resolution.discard.to_string();
            discarded += tx.execute(
                "UPDATE media SET is_deleted = 1 WHERE id = ?1 AND is_deleted = 0",
                params![discard],
            )?;
            tx.execute(
                "DELETE FROM duplicates WHERE media_id = ?1 OR duplicate_id = ?1",
                params![discard],
            )?;
        }
        tx.commit()?;
        tracing::info!("Soft-deleted {} duplicate items", discarded);
        Ok(discarded)
    }

    fn count(&self) -> Result<usize, PersistenceError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM media", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Raw column values of a media row
struct MediaRow {
    id: String,
    path: String,
    size_bytes: i64,
    category: String,
    fingerprint: Option<String>,
    is_deleted: bool,
    exif: Option<String>,
    thumbnail_path: Option<String>,
    file_hash: Option<String>,
    analysis: Option<String>,
    statuses: [String; 5],
}

impl MediaRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            path: row.get(1)?,
            size_bytes: row.get(2)?,
            category: row.get(3)?,
            fingerprint: row.get(4)?,
            is_deleted: row.get(5)?,
            exif: row.get(6)?,
            thumbnail_path: row.get(7)?,
            file_hash: row.get(8)?,
            analysis: row.get(9)?,
            statuses: [
                row.get(10)?,
                row.get(11)?,
                row.get(12)?,
                row.get(13)?,
                row.get(14)?,
            ],
        })
    }

    fn into_item(self) -> Result<MediaItem, PersistenceError> {
        let corrupt = |what: &str, e: String| {
            PersistenceError::Corrupt(format!("{} of media {}: {}", what, self.id, e))
        };

        let [examined, thumbnailed, hashed, dedup_checked, analyzed] = &self.statuses;
        let status = |raw: &String| {
            raw.parse::<StageStatus>()
                .map_err(|e| corrupt("status", e))
        };
        let flags = StageFlags {
            examined: status(examined)?,
            thumbnailed: status(thumbnailed)?,
            hashed: status(hashed)?,
            dedup_checked: status(dedup_checked)?,
            analyzed: status(analyzed)?,
        };

        let fingerprint = self
            .fingerprint
            .as_deref()
            .map(Fingerprint::parse)
            .transpose()
            .map_err(|e| corrupt("fingerprint", e.to_string()))?;
        let exif: Option<ExifData> = self
            .exif
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| corrupt("exif", e.to_string()))?;
        let analysis: Option<AnalysisData> = self
            .analysis
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| corrupt("analysis", e.to_string()))?;
        let category: MediaCategory = self.category.parse().map_err(|e| corrupt("category", e))?;

        Ok(MediaItem {
            id: parse_media_id(&self.id)?,
            path: PathBuf::from(&self.path),
            size_bytes: self.size_bytes as u64,
            category,
            fingerprint,
            is_deleted: self.is_deleted,
            exif,
            thumbnail_path: self.thumbnail_path.as_ref().map(PathBuf::from),
            file_hash: self.file_hash.clone(),
            analysis,
            flags,
        })
    }
}

fn parse_media_id(raw: &str) -> Result<MediaId, PersistenceError> {
    raw.parse()
        .map_err(|e| PersistenceError::Corrupt(format!("media id '{}': {}", raw, e)))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, PersistenceError> {
    serde_json::to_string(value).map_err(|e| PersistenceError::QueryFailed(e.to_string()))
}
