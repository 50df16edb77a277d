//! # Core Module
//!
//! The media ingest and duplicate detection engine.
//!
//! ## Modules
//! - `media` - Media items, stages and the rows stages produce
//! - `scanner` - Discovers media files in directories
//! - `fingerprint` - Computes dHash fingerprints
//! - `comparator` - Hamming distance and similarity tiers
//! - `cluster` - Groups exact and near-duplicate fingerprints
//! - `canonical` - Picks the copy to keep and resolves identical pairs
//! - `extract` - EXIF, thumbnail and quality extraction
//! - `queue` - Leased, retrying job queues per stage
//! - `storage` - Media store with grouped writes
//! - `stage` - Batch processing for every pipeline stage
//! - `worker` - Queue consumer loop and cancellation
//! - `audit` - Queue versus store consistency checks
//! - `context` - Wires config, store, queues and stages together

pub mod audit;
pub mod canonical;
pub mod cluster;
pub mod comparator;
pub mod context;
pub mod extract;
pub mod fingerprint;
pub mod media;
pub mod queue;
pub mod scanner;
pub mod stage;
pub mod storage;
pub mod worker;

// Re-export commonly used types
pub use cluster::{ClusterResult, DuplicateCluster, DuplicateClusterer};
pub use comparator::{HashComparator, SimilarityTier};
pub use context::PipelineContext;
pub use fingerprint::{Fingerprint, FingerprintGenerator};
pub use media::{MediaId, MediaItem, Stage};
pub use stage::{BatchSummary, StageRunner};
pub use worker::CancelToken;
