//! In-process queue backend.

use super::{
    check_payloads, log_reset, Clock, FailDisposition, Job, JobId, JobPayload, JobQueue,
    JobState, QueueCounts, QueueSettings, SystemClock, WorkerId,
};
use crate::core::media::Stage;
use crate::error::QueueError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    next_sequence: u64,
    paused: bool,
}

impl QueueState {
    fn in_state(&self, state: JobState) -> Vec<&Job> {
        self.jobs.values().filter(|j| j.state == state).collect()
    }

    fn get_mut(&mut self, id: JobId) -> Result<&mut Job, QueueError> {
        self.jobs.get_mut(&id).ok_or(QueueError::UnknownJob(id))
    }
}

/// Mutex-guarded queue for a single process
pub struct MemoryJobQueue {
    stage: Stage,
    settings: QueueSettings,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
}

impl MemoryJobQueue {
    pub fn new(stage: Stage, settings: QueueSettings) -> Self {
        Self::with_clock(stage, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(stage: Stage, settings: QueueSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            stage,
            settings,
            clock,
            state: Mutex::new(QueueState::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, QueueError> {
        self.state.lock().map_err(|_| QueueError::LockPoisoned)
    }

    fn housekeeping(&self, state: &mut QueueState) -> usize {
        let now = self.clock.now();
        let mut expired = 0;
        for job in state.jobs.values_mut() {
            if job.lease_expired(now) {
                tracing::warn!(
                    "Lease on job {} held by {:?} expired, returning to waiting",
                    job.id,
                    job.lease_owner
                );
                job.expire_lease();
                expired += 1;
            } else if job.is_due(now) {
                job.promote();
            }
        }
        expired
    }

    fn prune(&self, state: &mut QueueState, terminal: JobState) {
        let keep = match terminal {
            JobState::Completed => self.settings.keep_completed,
            _ => self.settings.keep_failed,
        };
        let mut finished: Vec<(Option<chrono::DateTime<chrono::Utc>>, u64, JobId)> = state
            .in_state(terminal)
            .into_iter()
            .map(|j| (j.finished_at, j.sequence, j.id))
            .collect();
        if finished.len() <= keep {
            return;
        }
        finished.sort();
        let excess = finished.len() - keep;
        for (_, _, id) in finished.into_iter().take(excess) {
            state.jobs.remove(&id);
        }
    }
}

impl JobQueue for MemoryJobQueue {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    fn enqueue(&self, payloads: Vec<JobPayload>) -> Result<Vec<JobId>, QueueError> {
        check_payloads(self.stage, &payloads)?;
        let now = self.clock.now();
        let mut state = self.lock()?;

        let mut open: HashMap<String, JobId> = state
            .jobs
            .values()
            .filter(|j| !j.state.is_terminal())
            .map(|j| (j.dedupe_key.clone(), j.id))
            .collect();

        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            if let Some(&id) = open.get(&payload.dedupe_key()) {
                ids.push(id);
                continue;
            }

            state.next_sequence += 1;
            let job = Job::new(payload, self.settings.max_attempts, state.next_sequence, now);
            ids.push(job.id);
            open.insert(job.dedupe_key.clone(), job.id);
            state.jobs.insert(job.id, job);
        }
        Ok(ids)
    }

    fn lease(&self, worker: &WorkerId, max: usize) -> Result<Vec<Job>, QueueError> {
        let mut state = self.lock()?;
        self.housekeeping(&mut state);
        if state.paused {
            return Ok(Vec::new());
        }

        let active = state.in_state(JobState::Active).len();
        let slots = self.settings.concurrency.saturating_sub(active).min(max);
        if slots == 0 {
            return Ok(Vec::new());
        }

        let mut waiting: Vec<(u64, JobId)> = state
            .in_state(JobState::Waiting)
            .into_iter()
            .map(|j| (j.sequence, j.id))
            .collect();
        waiting.sort_unstable();

        let now = self.clock.now();
        let ttl = self.settings.lease_ttl();
        let mut leased = Vec::with_capacity(slots);
        for (_, id) in waiting.into_iter().take(slots) {
            let job = state.get_mut(id)?;
            job.begin_lease(worker, now, ttl);
            leased.push(job.clone());
        }
        Ok(leased)
    }

    fn complete(&self, id: JobId, worker: &WorkerId) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let job = state.get_mut(id)?;
        job.ensure_holder(worker)?;
        job.complete(now);
        self.prune(&mut state, JobState::Completed);
        Ok(())
    }

    fn fail(
        &self,
        id: JobId,
        worker: &WorkerId,
        reason: &str,
        retryable: bool,
    ) -> Result<FailDisposition, QueueError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let job = state.get_mut(id)?;
        job.ensure_holder(worker)?;
        let disposition = job.fail(reason, retryable, now, self.settings.backoff);
        if disposition == FailDisposition::Failed {
            self.prune(&mut state, JobState::Failed);
        }
        Ok(disposition)
    }

    fn release(&self, id: JobId, worker: &WorkerId) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        let job = state.get_mut(id)?;
        job.ensure_holder(worker)?;
        job.release();
        Ok(())
    }

    fn reap_expired(&self) -> Result<usize, QueueError> {
        let mut state = self.lock()?;
        Ok(self.housekeeping(&mut state))
    }

    fn counts(&self) -> Result<QueueCounts, QueueError> {
        let mut state = self.lock()?;
        self.housekeeping(&mut state);
        let mut counts = QueueCounts::default();
        for job in state.jobs.values() {
            counts.add_n(job.state, state.paused, 1);
        }
        Ok(counts)
    }

    fn reset_state(&self, target: JobState) -> Result<usize, QueueError> {
        if target == JobState::Active {
            return Err(QueueError::UnsupportedReset(target));
        }
        let mut state = self.lock()?;
        let before = state.jobs.len();
        state.jobs.retain(|_, job| job.state != target);
        let removed = before - state.jobs.len();
        log_reset(self.stage, target, removed);
        Ok(removed)
    }

    fn drain(&self) -> Result<usize, QueueError> {
        let mut state = self.lock()?;
        let before = state.jobs.len();
        state
            .jobs
            .retain(|_, job| !matches!(job.state, JobState::Waiting | JobState::Delayed));
        let removed = before - state.jobs.len();
        tracing::warn!("Drained {} queue: removed {} jobs", self.stage.queue_name(), removed);
        Ok(removed)
    }

    fn pause(&self) -> Result<(), QueueError> {
        self.lock()?.paused = true;
        Ok(())
    }

    fn resume(&self) -> Result<(), QueueError> {
        self.lock()?.paused = false;
        Ok(())
    }

    fn is_paused(&self) -> Result<bool, QueueError> {
        Ok(self.lock()?.paused)
    }

    fn recent(&self, target: JobState, limit: usize) -> Result<Vec<Job>, QueueError> {
        let state = self.lock()?;
        let mut jobs: Vec<Job> = state.in_state(target).into_iter().cloned().collect();
        jobs.sort_by(|a, b| {
            b.finished_at
                .cmp(&a.finished_at)
                .then(b.sequence.cmp(&a.sequence))
        });
        jobs.truncate(limit);
        Ok(jobs)
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.lock()?.jobs.get(&id).cloned())
    }
}
