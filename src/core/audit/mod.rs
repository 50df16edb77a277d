//! # Audit Module
//!
//! Cross-checks what a stage queue says happened against what the store holds.
//!
//! ## Checks
//! - A `Completed` job whose item is missing, or still lacks the stage's
//!   effect, is reported as *completed but missing effect*
//! - A terminally `Failed` job whose item nevertheless carries the effect is
//!   reported as *failed but has effect*
//!
//! Both point at a crash between the grouped write and the acknowledgement.
//! The auditor only reads; it never repairs anything.

use crate::core::media::{MediaId, MediaItem, Stage, StageStatus};
use crate::core::queue::{Job, JobId, JobQueue, JobState};
use crate::core::storage::MediaStore;
use crate::error::PipelineError;
use crate::events::{AuditEvent, EventSender};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// One job whose queue outcome disagrees with the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyMismatch {
    pub job_id: JobId,
    pub media_id: MediaId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    pub stage: Stage,
    pub completed_but_missing_effect: Vec<ConsistencyMismatch>,
    pub failed_but_has_effect: Vec<ConsistencyMismatch>,
    pub total_mismatches: usize,
    /// Jobs inspected
    pub sampled: usize,
}

impl AuditReport {
    pub fn is_consistent(&self) -> bool {
        self.total_mismatches == 0
    }
}

pub struct ConsistencyAuditor {
    store: Arc<dyn MediaStore>,
    queues: HashMap<Stage, Arc<dyn JobQueue>>,
    sample_size: usize,
    events: EventSender,
}

impl ConsistencyAuditor {
    /// Inspect at most `sample_size` recent jobs per terminal state
    pub fn new(store: Arc<dyn MediaStore>, sample_size: usize) -> Self {
        Self {
            store,
            queues: HashMap::new(),
            sample_size,
            events: EventSender::null(),
        }
    }

    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queues.insert(queue.stage(), queue);
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    pub fn audit(&self, stage: Stage) -> Result<AuditReport, PipelineError> {
        let queue = self.queues.get(&stage).ok_or_else(|| {
            PipelineError::InvalidRequest(format!("no {} queue to audit", stage))
        })?;

        let mut report = AuditReport {
            stage,
            completed_but_missing_effect: Vec::new(),
            failed_but_has_effect: Vec::new(),
            total_mismatches: 0,
            sampled: 0,
        };

        // Scan jobs produce new rows, not an effect on one item
        if stage.is_per_item() {
            let completed = queue.recent(JobState::Completed, self.sample_size)?;
            let failed = queue.recent(JobState::Failed, self.sample_size)?;
            report.sampled = completed.len() + failed.len();

            let ids: Vec<MediaId> = completed
                .iter()
                .chain(&failed)
                .filter_map(|job| job.payload.media_id())
                .collect();
            let items: HashMap<MediaId, MediaItem> = self
                .store
                .find_by_ids(&ids)?
                .into_iter()
                .map(|item| (item.id, item))
                .collect();

            report.completed_but_missing_effect = completed
                .iter()
                .filter_map(|job| missing_effect(stage, job, &items))
                .collect();
            report.failed_but_has_effect = failed
                .iter()
                .filter_map(|job| unexpected_effect(stage, job, &items))
                .collect();
            report.total_mismatches =
                report.completed_but_missing_effect.len() + report.failed_but_has_effect.len();
        }

        if report.is_consistent() {
            tracing::info!("Audit of {}: {} jobs consistent", stage, report.sampled);
        } else {
            tracing::warn!(
                "Audit of {}: {} mismatches in {} sampled jobs",
                stage,
                report.total_mismatches,
                report.sampled
            );
        }
        self.events
            .send(AuditEvent::Completed(report.clone()));
        Ok(report)
    }
}

/// Whether the stage's output landed on the item
fn has_effect(stage: Stage, item: &MediaItem) -> bool {
    let data_present = match stage {
        Stage::Scan | Stage::Dedup => true,
        Stage::Exif => item.exif.is_some(),
        Stage::Thumbnail => item.thumbnail_path.is_some(),
        Stage::Hash => item.fingerprint.is_some(),
        Stage::Analysis => item.analysis.is_some(),
    };
    data_present && item.status(stage) == StageStatus::Done
}

fn missing_effect(
    stage: Stage,
    job: &Job,
    items: &HashMap<MediaId, MediaItem>,
) -> Option<ConsistencyMismatch> {
    let media_id = job.payload.media_id()?;
    let reason = match items.get(&media_id) {
        None => "item no longer exists".to_string(),
        // Resolved duplicates are removed on purpose
        Some(item) if item.is_deleted => return None,
        Some(item) if has_effect(stage, item) => return None,
        Some(item) => format!("job completed but item status is {}", item.status(stage).as_str()),
    };
    Some(ConsistencyMismatch {
        job_id: job.id,
        media_id,
        reason,
    })
}

fn unexpected_effect(
    stage: Stage,
    job: &Job,
    items: &HashMap<MediaId, MediaItem>,
) -> Option<ConsistencyMismatch> {
    let media_id = job.payload.media_id()?;
    let item = items.get(&media_id)?;
    has_effect(stage, item).then(|| ConsistencyMismatch {
        job_id: job.id,
        media_id,
        reason: format!(
            "job failed ({}) but the item has its {} output",
            job.last_error.as_deref().unwrap_or("no error recorded"),
            stage
        ),
    })
}
