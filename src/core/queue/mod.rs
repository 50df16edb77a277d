//! # Queue Module
//!
//! Durable, named work queues, one per pipeline stage.
//!
//! ## Guarantees
//! - At most `concurrency` jobs are `Active` at once, and a job has exactly
//!   one lease holder
//! - At-least-once delivery: a lease that outlives its TTL puts the job back
//!   to `Waiting`, and a late acknowledgement from the old holder is rejected
//! - Failed jobs with attempts left come back after exponential backoff;
//!   non-retryable failures are terminal at once
//! - Enqueueing work that is already waiting, delayed or active returns the
//!   existing job instead of adding a second copy
//! - Terminal jobs are pruned by the retention limits, never by callers
//!
//! `reset_state` and `drain` are administrative and logged at warn level.

mod clock;
mod job;
mod memory;
mod sqlite;

pub use clock::{Clock, ManualClock, SystemClock};
pub use job::{
    BackoffPolicy, FailDisposition, Job, JobId, JobPayload, JobState, MediaPayload, ScanPayload,
    WorkerId,
};
pub use memory::MemoryJobQueue;
pub use sqlite::SqliteJobQueue;

use crate::core::media::Stage;
use crate::error::QueueError;
use chrono::Duration;
use serde::{Deserialize, Serialize};

const MAX_LEASE_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Per-queue behaviour
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Maximum simultaneously active jobs
    pub concurrency: usize,
    /// Leases a job may receive before a failure is final
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub lease_ttl_secs: u64,
    /// Completed jobs kept for inspection
    pub keep_completed: usize,
    /// Failed jobs kept for inspection
    pub keep_failed: usize,
}

impl QueueSettings {
    pub fn lease_ttl(&self) -> Duration {
        Duration::seconds(self.lease_ttl_secs.min(MAX_LEASE_TTL_SECS) as i64)
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency: 10,
            max_attempts: 2,
            backoff: BackoffPolicy::new(1000),
            lease_ttl_secs: 30,
            keep_completed: 1000,
            keep_failed: 1000,
        }
    }
}

/// Jobs per state. Waiting jobs of a paused queue are reported as `paused`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub paused: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.waiting + self.active + self.completed + self.failed + self.delayed + self.paused
    }

    /// Jobs still to be processed
    pub fn outstanding(&self) -> usize {
        self.waiting + self.active + self.delayed + self.paused
    }

    /// Count `n` jobs in `state`
    fn add_n(&mut self, state: JobState, paused: bool, n: usize) {
        let bucket = match state {
            JobState::Waiting if paused => &mut self.paused,
            JobState::Waiting => &mut self.waiting,
            JobState::Active => &mut self.active,
            JobState::Delayed => &mut self.delayed,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
        };
        *bucket += n;
    }
}

/// A stage's work queue.
///
/// All operations are atomic with respect to each other.
pub trait JobQueue: Send + Sync {
    fn stage(&self) -> Stage;

    fn settings(&self) -> &QueueSettings;

    /// Add jobs in order. Payloads must belong to this queue's stage.
    fn enqueue(&self, payloads: Vec<JobPayload>) -> Result<Vec<JobId>, QueueError>;

    /// Lease up to `max` waiting jobs to `worker`, bounded by the free
    /// concurrency slots. Expired leases and due retries are handled first.
    fn lease(&self, worker: &WorkerId, max: usize) -> Result<Vec<Job>, QueueError>;

    fn complete(&self, job: JobId, worker: &WorkerId) -> Result<(), QueueError>;

    fn fail(
        &self,
        job: JobId,
        worker: &WorkerId,
        reason: &str,
        retryable: bool,
    ) -> Result<FailDisposition, QueueError>;

    /// Return a leased job that was never started
    fn release(&self, job: JobId, worker: &WorkerId) -> Result<(), QueueError>;

    /// Move jobs whose lease timed out back to `Waiting`
    fn reap_expired(&self) -> Result<usize, QueueError>;

    fn counts(&self) -> Result<QueueCounts, QueueError>;

    /// Remove every job in `state`. Active jobs cannot be reset.
    fn reset_state(&self, state: JobState) -> Result<usize, QueueError>;

    /// Remove all waiting and delayed jobs
    fn drain(&self) -> Result<usize, QueueError>;

    fn pause(&self) -> Result<(), QueueError>;

    fn resume(&self) -> Result<(), QueueError>;

    fn is_paused(&self) -> Result<bool, QueueError>;

    /// Newest jobs in `state` (terminal states by finish time)
    fn recent(&self, state: JobState, limit: usize) -> Result<Vec<Job>, QueueError>;

    fn get(&self, job: JobId) -> Result<Option<Job>, QueueError>;
}

fn check_payloads(stage: Stage, payloads: &[JobPayload]) -> Result<(), QueueError> {
    match payloads.iter().find(|p| p.stage() != stage) {
        Some(wrong) => Err(QueueError::PayloadMismatch {
            queue: stage,
            payload: wrong.stage(),
        }),
        None => Ok(()),
    }
}

fn log_reset(stage: Stage, state: JobState, removed: usize) {
    tracing::warn!(
        "Reset {} queue: removed {} {} jobs",
        stage.queue_name(),
        removed,
        state
    );
}
