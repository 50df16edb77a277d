//! # Media Module
//!
//! The media item model shared by every pipeline stage.
//!
//! Items are owned by the [`MediaStore`](crate::core::storage::MediaStore);
//! stages only hold transient copies for the length of one batch.

mod records;

pub use records::{
    AnalysisRecord, DuplicatePair, ExifRecord, FingerprintRecord, NewMedia, Resolution,
    StatusUpdate, ThumbnailRecord, UpsertBatch,
};

use crate::core::fingerprint::Fingerprint;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

/// Stable identity of a media item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaId(Uuid);

impl MediaId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic id, mostly useful for fixtures
    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MediaId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MediaId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Broad media category, decided from the file extension at scan time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaCategory {
    Image,
    Raw,
    Video,
    Other,
}

impl MediaCategory {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" | "png" | "webp" | "gif" | "bmp" | "tif" | "tiff" => Self::Image,
            "sr2" | "nef" | "arw" | "cr2" | "cr3" | "dng" | "raf" | "rw2" | "orf" | "pef"
            | "3fr" | "fff" | "iiq" | "rwl" | "srw" | "x3f" => Self::Raw,
            "mp4" | "mov" | "avi" | "mkv" | "m4v" | "webm" => Self::Video,
            _ => Self::Other,
        }
    }

    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .map(Self::from_extension)
            .unwrap_or(Self::Other)
    }

    /// Ignored categories are never selected by any stage
    pub fn is_ignored(&self) -> bool {
        matches!(self, Self::Other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Raw => "raw",
            Self::Video => "video",
            Self::Other => "other",
        }
    }
}

impl FromStr for MediaCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(Self::Image),
            "raw" => Ok(Self::Raw),
            "video" => Ok(Self::Video),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown media category '{}'", other)),
        }
    }
}

/// Pipeline stages, in processing order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Scan,
    Exif,
    Thumbnail,
    Hash,
    Dedup,
    Analysis,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Scan,
        Stage::Exif,
        Stage::Thumbnail,
        Stage::Hash,
        Stage::Dedup,
        Stage::Analysis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Scan => "scan",
            Stage::Exif => "exif",
            Stage::Thumbnail => "thumbnail",
            Stage::Hash => "hash",
            Stage::Dedup => "dedup",
            Stage::Analysis => "analysis",
        }
    }

    /// Name of the stage's durable queue
    pub fn queue_name(&self) -> &'static str {
        match self {
            Stage::Scan => "folderScanQueue",
            Stage::Exif => "exifQueue",
            Stage::Thumbnail => "thumbnailQueue",
            Stage::Hash => "visualHashQueue",
            Stage::Dedup => "duplicatesQueue",
            Stage::Analysis => "advancedAnalysisQueue",
        }
    }

    /// Stage an item must have finished before this one applies
    pub fn prerequisite(&self) -> Option<Stage> {
        match self {
            Stage::Scan | Stage::Exif => None,
            Stage::Thumbnail => Some(Stage::Exif),
            Stage::Hash => Some(Stage::Thumbnail),
            Stage::Dedup => Some(Stage::Hash),
            Stage::Analysis => Some(Stage::Dedup),
        }
    }

    /// Stage that follows this one
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Scan => Some(Stage::Exif),
            Stage::Exif => Some(Stage::Thumbnail),
            Stage::Thumbnail => Some(Stage::Hash),
            Stage::Hash => Some(Stage::Dedup),
            Stage::Dedup => Some(Stage::Analysis),
            Stage::Analysis => None,
        }
    }

    /// Whether items of `category` go through this stage at all
    pub fn applies_to(&self, category: MediaCategory) -> bool {
        match self {
            Stage::Scan => !category.is_ignored(),
            Stage::Exif => matches!(category, MediaCategory::Image | MediaCategory::Raw),
            Stage::Thumbnail | Stage::Hash | Stage::Dedup | Stage::Analysis => {
                category == MediaCategory::Image
            }
        }
    }

    /// Per-item stages carry a status flag on the media item
    pub fn is_per_item(&self) -> bool {
        !matches!(self, Stage::Scan)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s || stage.queue_name() == s)
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

/// Per-stage lifecycle flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    #[default]
    Pending,
    Done,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Done => "done",
            StageStatus::Failed => "failed",
        }
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StageStatus::Pending),
            "done" => Ok(StageStatus::Done),
            "failed" => Ok(StageStatus::Failed),
            other => Err(format!("unknown stage status '{}'", other)),
        }
    }
}

/// Lifecycle flags of the per-item stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageFlags {
    pub examined: StageStatus,
    pub thumbnailed: StageStatus,
    pub hashed: StageStatus,
    pub dedup_checked: StageStatus,
    pub analyzed: StageStatus,
}

impl StageFlags {
    /// Status for `stage`; a stored item has always been scanned
    pub fn get(&self, stage: Stage) -> StageStatus {
        match stage {
            Stage::Scan => StageStatus::Done,
            Stage::Exif => self.examined,
            Stage::Thumbnail => self.thumbnailed,
            Stage::Hash => self.hashed,
            Stage::Dedup => self.dedup_checked,
            Stage::Analysis => self.analyzed,
        }
    }

    pub fn set(&mut self, stage: Stage, status: StageStatus) {
        match stage {
            Stage::Scan => {}
            Stage::Exif => self.examined = status,
            Stage::Thumbnail => self.thumbnailed = status,
            Stage::Hash => self.hashed = status,
            Stage::Dedup => self.dedup_checked = status,
            Stage::Analysis => self.analyzed = status,
        }
    }
}

/// Metadata read from a file's EXIF block
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExifData {
    pub taken_at: Option<NaiveDateTime>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub orientation: Option<u16>,
}

/// Image quality measurements
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalysisData {
    pub sharpness: f64,
    pub contrast: f64,
    pub brightness: f64,
    pub overall: f64,
    pub is_blurry: bool,
}

/// A media item as persisted by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: MediaId,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub category: MediaCategory,
    pub fingerprint: Option<Fingerprint>,
    pub is_deleted: bool,
    pub exif: Option<ExifData>,
    pub thumbnail_path: Option<PathBuf>,
    pub file_hash: Option<String>,
    pub analysis: Option<AnalysisData>,
    pub flags: StageFlags,
}

impl MediaItem {
    /// A freshly scanned item with every stage pending
    pub fn new(path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        let path = path.into();
        Self {
            id: MediaId::new(),
            category: MediaCategory::from_path(&path),
            path,
            size_bytes,
            fingerprint: None,
            is_deleted: false,
            exif: None,
            thumbnail_path: None,
            file_hash: None,
            analysis: None,
            flags: StageFlags::default(),
        }
    }

    pub fn with_id(mut self, id: MediaId) -> Self {
        self.id = id;
        self
    }

    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    /// Lowercased extension, empty when there is none
    pub fn extension(&self) -> String {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default()
    }

    /// Pixel dimensions from EXIF, when known
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        let exif = self.exif.as_ref()?;
        Some((exif.width?, exif.height?))
    }

    pub fn taken_at(&self) -> Option<NaiveDateTime> {
        self.exif.as_ref().and_then(|e| e.taken_at)
    }

    pub fn status(&self, stage: Stage) -> StageStatus {
        self.flags.get(stage)
    }

    /// Eligibility predicate for `stage`, read from persisted flags only
    pub fn is_eligible_for(&self, stage: Stage) -> bool {
        if self.is_deleted || self.category.is_ignored() || !stage.applies_to(self.category) {
            return false;
        }
        if !stage.is_per_item() || self.status(stage) != StageStatus::Pending {
            return false;
        }
        stage
            .prerequisite()
            .map_or(true, |previous| self.status(previous) == StageStatus::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_from_extension_ignores_case() {
        assert_eq!(MediaCategory::from_extension("JPG"), MediaCategory::Image);
        assert_eq!(MediaCategory::from_extension("nef"), MediaCategory::Raw);
        assert_eq!(MediaCategory::from_extension("MOV"), MediaCategory::Video);
        assert_eq!(MediaCategory::from_extension("txt"), MediaCategory::Other);
    }

    #[test]
    fn stage_parses_from_name_or_queue_name() {
        assert_eq!("thumbnail".parse::<Stage>(), Ok(Stage::Thumbnail));
        assert_eq!("visualHashQueue".parse::<Stage>(), Ok(Stage::Hash));
        assert!("bogus".parse::<Stage>().is_err());
    }

    #[test]
    fn stages_chain_in_order() {
        let mut current = Stage::Analysis;
        let mut chain = vec![current];
        while let Some(previous) = current.prerequisite() {
            chain.push(previous);
            current = previous;
        }
        chain.reverse();
        assert_eq!(
            chain,
            vec![
                Stage::Exif,
                Stage::Thumbnail,
                Stage::Hash,
                Stage::Dedup,
                Stage::Analysis
            ]
        );
    }

    #[test]
    fn eligibility_follows_previous_stage() {
        let mut item = MediaItem::new("/photos/a.jpg", 10);
        assert!(item.is_eligible_for(Stage::Exif));
        assert!(!item.is_eligible_for(Stage::Thumbnail));

        item.flags.set(Stage::Exif, StageStatus::Done);
        assert!(!item.is_eligible_for(Stage::Exif));
        assert!(item.is_eligible_for(Stage::Thumbnail));

        item.flags.set(Stage::Exif, StageStatus::Failed);
        assert!(!item.is_eligible_for(Stage::Thumbnail));
    }

    #[test]
    fn deleted_and_ignored_items_are_never_eligible() {
        let mut deleted = MediaItem::new("/photos/a.jpg", 10);
        deleted.is_deleted = true;
        assert!(!deleted.is_eligible_for(Stage::Exif));

        let ignored = MediaItem::new("/photos/notes.txt", 10);
        assert!(!ignored.is_eligible_for(Stage::Exif));
    }

    #[test]
    fn raw_files_stop_after_exif() {
        let mut raw = MediaItem::new("/photos/DSC0001.NEF", 10);
        assert!(raw.is_eligible_for(Stage::Exif));
        raw.flags.set(Stage::Exif, StageStatus::Done);
        assert!(!raw.is_eligible_for(Stage::Thumbnail));
    }
}
