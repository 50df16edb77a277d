//! Event type definitions for progress reporting.

use crate::core::audit::AuditReport;
use crate::core::media::{MediaId, Stage};
use crate::core::queue::JobState;
use crate::core::stage::BatchSummary;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// All events emitted by the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// Stage batch lifecycle, including folder scans
    Stage(StageEvent),
    /// Queue administration and acknowledgements
    Queue(QueueEvent),
    /// Clustering and identical-duplicate resolution
    Dedup(DedupEvent),
    /// Consistency audits
    Audit(AuditEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageEvent {
    /// Progress while walking a scan root
    ScanProgress(ScanProgress),
    BatchStarted { stage: Stage, items: usize },
    /// One item failed; sibling items are unaffected
    ItemFailed {
        stage: Stage,
        media_id: Option<MediaId>,
        message: String,
        retryable: bool,
    },
    BatchCompleted { stage: Stage, summary: BatchSummary },
    /// The grouped write failed and nothing of the batch was persisted
    BatchAborted { stage: Stage, message: String },
}

/// Progress information during a folder scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanProgress {
    pub root: PathBuf,
    pub directories_scanned: usize,
    pub files_found: usize,
    pub current_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueEvent {
    Enqueued { stage: Stage, jobs: usize },
    /// Outcome of acknowledging one leased batch
    Settled {
        stage: Stage,
        completed: usize,
        retrying: usize,
        failed: usize,
        released: usize,
    },
    Reset {
        stage: Stage,
        state: JobState,
        removed: usize,
    },
    Drained { stage: Stage, removed: usize },
    Paused { stage: Stage },
    Resumed { stage: Stage },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DedupEvent {
    Clustered {
        exact_groups: usize,
        near_groups: usize,
        skipped_comparisons: usize,
    },
    Resolved {
        discarded: usize,
        undecided: usize,
        skipped: usize,
        dry_run: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuditEvent {
    Completed(AuditReport),
}

impl From<StageEvent> for Event {
    fn from(event: StageEvent) -> Self {
        Event::Stage(event)
    }
}

impl From<QueueEvent> for Event {
    fn from(event: QueueEvent) -> Self {
        Event::Queue(event)
    }
}

impl From<DedupEvent> for Event {
    fn from(event: DedupEvent) -> Self {
        Event::Dedup(event)
    }
}

impl From<AuditEvent> for Event {
    fn from(event: AuditEvent) -> Self {
        Event::Audit(event)
    }
}
