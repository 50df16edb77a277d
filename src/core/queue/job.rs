//! Job records, payloads and the per-job state machine.
//!
//! ```text
//! enqueue ─► Waiting ─lease─► Active ─complete─► Completed
//!               ▲               │
//!               │ lease expiry  ├─fail (attempts left)─► Delayed ─due─► Waiting
//!               │ or release    │
//!               └───────────────┘─fail (final)─► Failed
//! ```
//!
//! Both queue backends drive jobs through these methods so their semantics
//! cannot drift apart.

use crate::core::media::{MediaId, MediaItem, Stage};
use crate::error::QueueError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identity of a lease holder
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// `<prefix>-<random suffix>`
    pub fn generate(prefix: &str) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", prefix, &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Waiting,
        JobState::Active,
        JobState::Delayed,
        JobState::Completed,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state '{}'", s))
    }
}

/// Folder to walk
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanPayload {
    pub root: PathBuf,
}

/// A single media item to run a per-item stage on
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPayload {
    pub media_id: MediaId,
    pub path: PathBuf,
}

/// Work description, one variant per stage
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "payload", rename_all = "lowercase")]
pub enum JobPayload {
    Scan(ScanPayload),
    Exif(MediaPayload),
    Thumbnail(MediaPayload),
    Hash(MediaPayload),
    Dedup(MediaPayload),
    Analysis(MediaPayload),
}

impl JobPayload {
    /// Payload for running `stage` on `item`; `None` for the scan stage
    pub fn for_item(stage: Stage, item: &MediaItem) -> Option<Self> {
        let payload = MediaPayload {
            media_id: item.id,
            path: item.path.clone(),
        };
        match stage {
            Stage::Scan => None,
            Stage::Exif => Some(JobPayload::Exif(payload)),
            Stage::Thumbnail => Some(JobPayload::Thumbnail(payload)),
            Stage::Hash => Some(JobPayload::Hash(payload)),
            Stage::Dedup => Some(JobPayload::Dedup(payload)),
            Stage::Analysis => Some(JobPayload::Analysis(payload)),
        }
    }

    pub fn scan(root: impl Into<PathBuf>) -> Self {
        JobPayload::Scan(ScanPayload { root: root.into() })
    }

    pub fn stage(&self) -> Stage {
        match self {
            JobPayload::Scan(_) => Stage::Scan,
            JobPayload::Exif(_) => Stage::Exif,
            JobPayload::Thumbnail(_) => Stage::Thumbnail,
            JobPayload::Hash(_) => Stage::Hash,
            JobPayload::Dedup(_) => Stage::Dedup,
            JobPayload::Analysis(_) => Stage::Analysis,
        }
    }

    pub fn media(&self) -> Option<&MediaPayload> {
        match self {
            JobPayload::Scan(_) => None,
            JobPayload::Exif(p)
            | JobPayload::Thumbnail(p)
            | JobPayload::Hash(p)
            | JobPayload::Dedup(p)
            | JobPayload::Analysis(p) => Some(p),
        }
    }

    pub fn media_id(&self) -> Option<MediaId> {
        self.media().map(|p| p.media_id)
    }

    /// Identity used to collapse duplicate enqueues of unfinished work
    pub fn dedupe_key(&self) -> String {
        match self {
            JobPayload::Scan(p) => format!("scan:{}", p.root.display()),
            _ => match self.media_id() {
                Some(id) => format!("{}:{}", self.stage(), id),
                None => self.stage().to_string(),
            },
        }
    }
}

/// What happened to a failed job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailDisposition {
    /// Re-enqueued; becomes leasable at `available_at`
    Retrying { available_at: DateTime<Utc> },
    /// No attempts left or not retryable
    Failed,
}

const MAX_BACKOFF_MS: u64 = 24 * 60 * 60 * 1000;

/// Exponential retry delays: `base * 2^(attempt - 1)`, capped at one day
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_ms: u64,
}

impl BackoffPolicy {
    pub fn new(base_ms: u64) -> Self {
        Self { base_ms }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let millis = self
            .base_ms
            .saturating_mul(1u64 << exponent)
            .min(MAX_BACKOFF_MS);
        Duration::milliseconds(millis as i64)
    }
}

/// A queued unit of work
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub stage: Stage,
    /// Enqueue order within the queue
    pub sequence: u64,
    pub dedupe_key: String,
    pub payload: JobPayload,
    pub state: JobState,
    /// Leases granted so far
    pub attempts: u32,
    pub max_attempts: u32,
    pub available_at: DateTime<Utc>,
    pub lease_owner: Option<WorkerId>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(payload: JobPayload, max_attempts: u32, sequence: u64, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            stage: payload.stage(),
            sequence,
            dedupe_key: payload.dedupe_key(),
            payload,
            state: JobState::Waiting,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            available_at: now,
            lease_owner: None,
            lease_expires_at: None,
            last_error: None,
            enqueued_at: now,
            finished_at: None,
        }
    }

    /// Waiting -> Active, owned by `worker` until `now + ttl`
    pub(crate) fn begin_lease(&mut self, worker: &WorkerId, now: DateTime<Utc>, ttl: Duration) {
        self.state = JobState::Active;
        self.attempts += 1;
        self.lease_owner = Some(worker.clone());
        self.lease_expires_at = Some(now + ttl);
    }

    pub(crate) fn ensure_holder(&self, worker: &WorkerId) -> Result<(), QueueError> {
        if self.state == JobState::Active && self.lease_owner.as_ref() == Some(worker) {
            Ok(())
        } else {
            Err(QueueError::NotLeaseHolder {
                job: self.id,
                worker: worker.clone(),
            })
        }
    }

    pub(crate) fn complete(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Completed;
        self.clear_lease();
        self.finished_at = Some(now);
    }

    pub(crate) fn fail(
        &mut self,
        reason: &str,
        retryable: bool,
        now: DateTime<Utc>,
        backoff: BackoffPolicy,
    ) -> FailDisposition {
        self.clear_lease();
        self.last_error = Some(reason.to_string());

        if retryable && self.attempts < self.max_attempts {
            self.state = JobState::Delayed;
            self.available_at = now + backoff.delay(self.attempts);
            FailDisposition::Retrying {
                available_at: self.available_at,
            }
        } else {
            self.state = JobState::Failed;
            self.finished_at = Some(now);
            FailDisposition::Failed
        }
    }

    /// Hand an unstarted job back without spending an attempt
    pub(crate) fn release(&mut self) {
        self.state = JobState::Waiting;
        self.attempts = self.attempts.saturating_sub(1);
        self.clear_lease();
    }

    pub(crate) fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Active && self.lease_expires_at.is_some_and(|at| at <= now)
    }

    /// Active -> Waiting after the holder went silent
    pub(crate) fn expire_lease(&mut self) {
        self.state = JobState::Waiting;
        self.clear_lease();
    }

    pub(crate) fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Delayed && self.available_at <= now
    }

    pub(crate) fn promote(&mut self) {
        self.state = JobState::Waiting;
    }

    fn clear_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        let payload = JobPayload::Hash(MediaPayload {
            media_id: MediaId::from_u128(7),
            path: PathBuf::from("/photos/a.jpg"),
        });
        Job::new(payload, 2, 1, Utc::now())
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let backoff = BackoffPolicy::new(1000);
        assert_eq!(backoff.delay(1), Duration::milliseconds(1000));
        assert_eq!(backoff.delay(2), Duration::milliseconds(2000));
        assert_eq!(backoff.delay(4), Duration::milliseconds(8000));
    }

    #[test]
    fn retryable_failure_with_attempts_left_is_delayed() {
        let mut job = job();
        let worker = WorkerId::new("w1");
        let now = Utc::now();

        job.begin_lease(&worker, now, Duration::seconds(30));
        let disposition = job.fail("io", true, now, BackoffPolicy::new(1000));
        assert!(matches!(disposition, FailDisposition::Retrying { .. }));
        assert_eq!(job.state, JobState::Delayed);
        assert!(!job.is_due(now));
        assert!(job.is_due(now + Duration::seconds(1)));

        job.promote();
        job.begin_lease(&worker, now, Duration::seconds(30));
        assert_eq!(
            job.fail("io", true, now, BackoffPolicy::new(1000)),
            FailDisposition::Failed
        );
        assert_eq!(job.state, JobState::Failed);
    }

    #[test]
    fn non_retryable_failure_is_terminal() {
        let mut job = job();
        let worker = WorkerId::new("w1");
        job.begin_lease(&worker, Utc::now(), Duration::seconds(30));
        assert_eq!(
            job.fail("bad image", false, Utc::now(), BackoffPolicy::new(1000)),
            FailDisposition::Failed
        );
    }

    #[test]
    fn only_the_holder_may_ack() {
        let mut job = job();
        job.begin_lease(&WorkerId::new("w1"), Utc::now(), Duration::seconds(30));
        assert!(job.ensure_holder(&WorkerId::new("w1")).is_ok());
        assert!(job.ensure_holder(&WorkerId::new("w2")).is_err());
    }

    #[test]
    fn payload_serialises_as_tagged_union() {
        let json = serde_json::to_value(JobPayload::scan("/photos")).unwrap();
        assert_eq!(json["stage"], "scan");
        assert_eq!(json["payload"]["root"], "/photos");
    }
}
