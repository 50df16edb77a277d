//! # Configuration
//!
//! Pipeline settings loaded from an optional TOML file, then overridden by
//! environment variables.
//!
//! ```toml
//! database_path = "/var/lib/media-pipeline/media.db"
//! scan_roots = ["/photos"]
//!
//! [stages.hash]
//! concurrency = 8
//!
//! [dedup]
//! max_hamming_distance = 6
//! ```
//!
//! Missing keys keep their defaults.

use crate::core::canonical::{CanonicalSelector, DEFAULT_RENAMED_PATTERN};
use crate::core::cluster::DEFAULT_INDEX_MIN_ITEMS;
use crate::core::comparator::{HashComparator, SimilarityThresholds, DEFAULT_MAX_DISTANCE};
use crate::core::extract::{DEFAULT_BLUR_THRESHOLD, DEFAULT_THUMBNAIL_EDGE};
use crate::core::media::Stage;
use crate::core::queue::{BackoffPolicy, QueueSettings};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Concurrency overrides, one per per-item stage
const CONCURRENCY_ENV: [(Stage, &str); 5] = [
    (Stage::Exif, "EXIF_WORKER_CONCURRENCY"),
    (Stage::Thumbnail, "THUMBNAIL_WORKER_CONCURRENCY"),
    (Stage::Hash, "HASH_WORKER_CONCURRENCY"),
    (Stage::Dedup, "DUPLICATES_WORKER_CONCURRENCY"),
    (Stage::Analysis, "ADVANCED_ANALYSIS_WORKER_CONCURRENCY"),
];

/// Worker settings of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSettings {
    pub concurrency: usize,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl StageSettings {
    const fn new(concurrency: usize, batch_size: usize, max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            concurrency,
            batch_size,
            max_attempts,
            backoff_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    pub scan: StageSettings,
    pub exif: StageSettings,
    pub thumbnail: StageSettings,
    pub hash: StageSettings,
    pub dedup: StageSettings,
    pub analysis: StageSettings,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            scan: StageSettings::new(1, 100, 3, 2000),
            exif: StageSettings::new(30, 500, 2, 1000),
            thumbnail: StageSettings::new(20, 500, 2, 1000),
            hash: StageSettings::new(20, 500, 2, 1000),
            dedup: StageSettings::new(10, 500, 2, 1000),
            analysis: StageSettings::new(4, 100, 2, 1000),
        }
    }
}

impl StagesConfig {
    pub fn get(&self, stage: Stage) -> &StageSettings {
        match stage {
            Stage::Scan => &self.scan,
            Stage::Exif => &self.exif,
            Stage::Thumbnail => &self.thumbnail,
            Stage::Hash => &self.hash,
            Stage::Dedup => &self.dedup,
            Stage::Analysis => &self.analysis,
        }
    }

    fn get_mut(&mut self, stage: Stage) -> &mut StageSettings {
        match stage {
            Stage::Scan => &mut self.scan,
            Stage::Exif => &mut self.exif,
            Stage::Thumbnail => &mut self.thumbnail,
            Stage::Hash => &mut self.hash,
            Stage::Dedup => &mut self.dedup,
            Stage::Analysis => &mut self.analysis,
        }
    }
}

/// Lease and retention settings shared by every queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub lease_ttl_secs: u64,
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 30,
            keep_completed: 1000,
            keep_failed: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    pub max_hamming_distance: u32,
    pub high_ratio: f64,
    pub medium_ratio: f64,
    /// Corpus size from which clustering uses the segment index
    pub index_min_items: usize,
    /// File names treated as auto-renamed when choosing a keeper
    pub renamed_pattern: String,
}

impl Default for DedupSettings {
    fn default() -> Self {
        let thresholds = SimilarityThresholds::default();
        Self {
            max_hamming_distance: DEFAULT_MAX_DISTANCE,
            high_ratio: thresholds.high_ratio,
            medium_ratio: thresholds.medium_ratio,
            index_min_items: DEFAULT_INDEX_MIN_ITEMS,
            renamed_pattern: DEFAULT_RENAMED_PATTERN.to_string(),
        }
    }
}

impl DedupSettings {
    pub fn thresholds(&self) -> Result<SimilarityThresholds, ConfigError> {
        SimilarityThresholds::new(self.high_ratio, self.medium_ratio)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn comparator(&self) -> Result<HashComparator, ConfigError> {
        Ok(HashComparator::new(self.thresholds()?, self.max_hamming_distance))
    }

    pub fn selector(&self) -> Result<CanonicalSelector, ConfigError> {
        CanonicalSelector::new(&self.renamed_pattern)
            .map_err(|e| ConfigError::Invalid(format!("renamed_pattern: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub database_path: PathBuf,
    pub queue_path: PathBuf,
    pub thumbnail_dir: PathBuf,
    pub scan_roots: Vec<PathBuf>,
    pub include_hidden: bool,
    pub follow_symlinks: bool,
    pub stages: StagesConfig,
    pub queue: QueueConfig,
    pub dedup: DedupSettings,
    /// Recent jobs per terminal state inspected by an audit
    pub audit_sample_size: usize,
    pub blur_threshold: f64,
    pub thumbnail_edge: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            database_path: data_dir.join("media.db"),
            queue_path: data_dir.join("queues.db"),
            thumbnail_dir: data_dir.join("thumbnails"),
            scan_roots: Vec::new(),
            include_hidden: false,
            follow_symlinks: false,
            stages: StagesConfig::default(),
            queue: QueueConfig::default(),
            dedup: DedupSettings::default(),
            audit_sample_size: 100,
            blur_threshold: DEFAULT_BLUR_THRESHOLD,
            thumbnail_edge: DEFAULT_THUMBNAIL_EDGE,
        }
    }
}

/// `<local data dir>/media-pipeline`, or `./.media-pipeline` without a home
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("media-pipeline"))
        .unwrap_or_else(|| PathBuf::from(".media-pipeline"))
}

impl PipelineConfig {
    /// Defaults, then `path` if given, then the process environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        for (stage, key) in CONCURRENCY_ENV {
            if let Some(value) = lookup(key) {
                let concurrency = value.trim().parse::<usize>().map_err(|_| {
                    ConfigError::Invalid(format!("{} must be a positive integer, got '{}'", key, value))
                })?;
                tracing::debug!("{} concurrency set to {} from {}", stage, concurrency, key);
                self.stages.get_mut(stage).concurrency = concurrency;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for stage in Stage::ALL {
            let settings = self.stages.get(stage);
            if settings.concurrency == 0 {
                return Err(ConfigError::Invalid(format!("{} concurrency must be at least 1", stage)));
            }
            if settings.batch_size == 0 {
                return Err(ConfigError::Invalid(format!("{} batch_size must be at least 1", stage)));
            }
            if settings.max_attempts == 0 {
                return Err(ConfigError::Invalid(format!("{} max_attempts must be at least 1", stage)));
            }
        }
        if self.queue.lease_ttl_secs == 0 {
            return Err(ConfigError::Invalid("lease_ttl_secs must be at least 1".to_string()));
        }
        if self.thumbnail_edge == 0 {
            return Err(ConfigError::Invalid("thumbnail_edge must be at least 1".to_string()));
        }
        if !(self.blur_threshold.is_finite() && self.blur_threshold >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "blur_threshold must be a non-negative number, got {}",
                self.blur_threshold
            )));
        }
        self.dedup.thresholds()?;
        self.dedup.selector()?;
        Ok(())
    }

    pub fn stage(&self, stage: Stage) -> &StageSettings {
        self.stages.get(stage)
    }

    /// Queue behaviour for `stage`, combining its worker and queue settings
    pub fn queue_settings(&self, stage: Stage) -> QueueSettings {
        let settings = self.stages.get(stage);
        QueueSettings {
            concurrency: settings.concurrency,
            max_attempts: settings.max_attempts,
            backoff: BackoffPolicy::new(settings.backoff_ms),
            lease_ttl_secs: self.queue.lease_ttl_secs,
            keep_completed: self.queue.keep_completed,
            keep_failed: self.queue.keep_failed,
        }
    }
}
