//! SQLite queue backend.
//!
//! Every primitive runs in one `IMMEDIATE` transaction, so a lease or an
//! acknowledgement is atomic even when several processes share the file.
//! Several queues can share one connection; rows are keyed by queue name.

use super::{
    check_payloads, log_reset, Clock, FailDisposition, Job, JobId, JobPayload, JobQueue,
    JobState, QueueCounts, QueueSettings, SystemClock, WorkerId,
};
use crate::core::media::Stage;
use crate::error::QueueError;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

const JOB_COLUMNS: &str = "id, seq, dedupe_key, payload, state, attempts, max_attempts, \
     available_at, lease_owner, lease_expires_at, last_error, enqueued_at, finished_at";

/// Queue persisted in a SQLite database
pub struct SqliteJobQueue {
    conn: Arc<Mutex<Connection>>,
    stage: Stage,
    settings: QueueSettings,
    clock: Arc<dyn Clock>,
}

impl SqliteJobQueue {
    /// Open or create the queue database at `path`
    pub fn open(path: &Path, stage: Stage, settings: QueueSettings) -> Result<Self, QueueError> {
        let conn = open_connection(path)?;
        Self::with_connection(Arc::new(Mutex::new(conn)), stage, settings, Arc::new(SystemClock))
    }

    /// Private in-memory database, mostly for tests
    pub fn in_memory(
        stage: Stage,
        settings: QueueSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(Arc::new(Mutex::new(conn)), stage, settings, clock)
    }

    /// Connection to the queue database at `path`, for sharing between stages
    pub fn connect(path: &Path) -> Result<Arc<Mutex<Connection>>, QueueError> {
        Ok(Arc::new(Mutex::new(open_connection(path)?)))
    }

    /// Queue on an existing connection, typically shared by all stages
    pub fn with_connection(
        conn: Arc<Mutex<Connection>>,
        stage: Stage,
        settings: QueueSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, QueueError> {
        {
            let guard = conn.lock().map_err(|_| QueueError::LockPoisoned)?;
            init_schema(&guard)?;
        }
        Ok(Self {
            conn,
            stage,
            settings,
            clock,
        })
    }

    fn name(&self) -> &'static str {
        self.stage.queue_name()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, QueueError> {
        self.conn.lock().map_err(|_| QueueError::LockPoisoned)
    }

    /// Run `f` inside an immediate transaction and commit on success
    fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, QueueError>,
    ) -> Result<T, QueueError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn housekeeping(&self, conn: &Connection) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();

        let expired = select_jobs(
            conn,
            "queue = ?1 AND state = 'active' AND lease_expires_at <= ?2",
            params![self.name(), now_ms],
        )?;
        for mut job in expired.iter().cloned() {
            tracing::warn!(
                "Lease on job {} held by {:?} expired, returning to waiting",
                job.id,
                job.lease_owner
            );
            job.expire_lease();
            save_job(conn, &job)?;
        }

        let due = select_jobs(
            conn,
            "queue = ?1 AND state = 'delayed' AND available_at <= ?2",
            params![self.name(), now_ms],
        )?;
        for mut job in due {
            job.promote();
            save_job(conn, &job)?;
        }

        Ok(expired.len())
    }

    fn is_paused_in(&self, conn: &Connection) -> Result<bool, QueueError> {
        let paused: Option<i64> = conn
            .query_row(
                "SELECT paused FROM queue_flags WHERE queue = ?1",
                params![self.name()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(paused.unwrap_or(0) != 0)
    }

    fn set_paused(&self, paused: bool) -> Result<(), QueueError> {
        self.write(|tx| {
            tx.execute(
                "INSERT INTO queue_flags (queue, paused) VALUES (?1, ?2)
                 ON CONFLICT(queue) DO UPDATE SET paused = excluded.paused",
                params![self.name(), paused as i64],
            )?;
            Ok(())
        })
    }

    fn load_held(&self, conn: &Connection, id: JobId, worker: &WorkerId) -> Result<Job, QueueError> {
        let job = select_jobs(
            conn,
            "queue = ?1 AND id = ?2",
            params![self.name(), id.to_string()],
        )?
        .into_iter()
        .next()
        .ok_or(QueueError::UnknownJob(id))?;
        job.ensure_holder(worker)?;
        Ok(job)
    }

    fn prune(&self, conn: &Connection, terminal: JobState) -> Result<(), QueueError> {
        let keep = match terminal {
            JobState::Completed => self.settings.keep_completed,
            _ => self.settings.keep_failed,
        };
        conn.execute(
            "DELETE FROM jobs WHERE id IN (
                SELECT id FROM jobs WHERE queue = ?1 AND state = ?2
                ORDER BY finished_at DESC, seq DESC LIMIT -1 OFFSET ?3
             )",
            params![self.name(), terminal.as_str(), keep as i64],
        )?;
        Ok(())
    }
}

impl JobQueue for SqliteJobQueue {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    fn enqueue(&self, payloads: Vec<JobPayload>) -> Result<Vec<JobId>, QueueError> {
        check_payloads(self.stage, &payloads)?;
        let now = self.clock.now();

        self.write(|tx| {
            let mut sequence: u64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM jobs WHERE queue = ?1",
                params![self.name()],
                |row| row.get::<_, i64>(0),
            )? as u64;

            let mut ids = Vec::with_capacity(payloads.len());
            for payload in payloads {
                let existing: Option<String> = tx
                    .query_row(
                        "SELECT id FROM jobs WHERE queue = ?1 AND dedupe_key = ?2
                         AND state IN ('waiting', 'active', 'delayed') LIMIT 1",
                        params![self.name(), payload.dedupe_key()],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(id) = existing {
                    ids.push(parse_id(&id)?);
                    continue;
                }

                sequence += 1;
                let job = Job::new(payload, self.settings.max_attempts, sequence, now);
                insert_job(tx, self.name(), &job)?;
                ids.push(job.id);
            }
            Ok(ids)
        })
    }

    fn lease(&self, worker: &WorkerId, max: usize) -> Result<Vec<Job>, QueueError> {
        let now = self.clock.now();
        let ttl = self.settings.lease_ttl();

        self.write(|tx| {
            self.housekeeping(tx)?;
            if self.is_paused_in(tx)? {
                return Ok(Vec::new());
            }

            let active: i64 = tx.query_row(
                "SELECT COUNT(*) FROM jobs WHERE queue = ?1 AND state = 'active'",
                params![self.name()],
                |row| row.get(0),
            )?;
            let slots = self
                .settings
                .concurrency
                .saturating_sub(active as usize)
                .min(max);
            if slots == 0 {
                return Ok(Vec::new());
            }

            let mut waiting = select_jobs(
                tx,
                "queue = ?1 AND state = 'waiting' ORDER BY seq LIMIT ?2",
                params![self.name(), slots as i64],
            )?;
            for job in &mut waiting {
                job.begin_lease(worker, now, ttl);
                save_job(tx, job)?;
            }
            Ok(waiting)
        })
    }

    fn complete(&self, id: JobId, worker: &WorkerId) -> Result<(), QueueError> {
        let now = self.clock.now();
        self.write(|tx| {
            let mut job = self.load_held(tx, id, worker)?;
            job.complete(now);
            save_job(tx, &job)?;
            self.prune(tx, JobState::Completed)
        })
    }

    fn fail(
        &self,
        id: JobId,
        worker: &WorkerId,
        reason: &str,
        retryable: bool,
    ) -> Result<FailDisposition, QueueError> {
        let now = self.clock.now();
        self.write(|tx| {
            let mut job = self.load_held(tx, id, worker)?;
            let disposition = job.fail(reason, retryable, now, self.settings.backoff);
            save_job(tx, &job)?;
            if disposition == FailDisposition::Failed {
                self.prune(tx, JobState::Failed)?;
            }
            Ok(disposition)
        })
    }

    fn release(&self, id: JobId, worker: &WorkerId) -> Result<(), QueueError> {
        self.write(|tx| {
            let mut job = self.load_held(tx, id, worker)?;
            job.release();
            save_job(tx, &job)
        })
    }

    fn reap_expired(&self) -> Result<usize, QueueError> {
        self.write(|tx| self.housekeeping(tx))
    }

    fn counts(&self) -> Result<QueueCounts, QueueError> {
        self.write(|tx| {
            self.housekeeping(tx)?;
            let paused = self.is_paused_in(tx)?;

            let mut stmt =
                tx.prepare("SELECT state, COUNT(*) FROM jobs WHERE queue = ?1 GROUP BY state")?;
            let rows = stmt.query_map(params![self.name()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;

            let mut counts = QueueCounts::default();
            for row in rows {
                let (state, count) = row?;
                counts.add_n(parse_state(&state)?, paused, count as usize);
            }
            Ok(counts)
        })
    }

    fn reset_state(&self, state: JobState) -> Result<usize, QueueError> {
        if state == JobState::Active {
            return Err(QueueError::UnsupportedReset(state));
        }
        let removed = self.write(|tx| {
            Ok(tx.execute(
                "DELETE FROM jobs WHERE queue = ?1 AND state = ?2",
                params![self.name(), state.as_str()],
            )?)
        })?;
        log_reset(self.stage, state, removed);
        Ok(removed)
    }

    fn drain(&self) -> Result<usize, QueueError> {
        let removed = self.write(|tx| {
            Ok(tx.execute(
                "DELETE FROM jobs WHERE queue = ?1 AND state IN ('waiting', 'delayed')",
                params![self.name()],
            )?)
        })?;
        tracing::warn!("Drained {} queue: removed {} jobs", self.name(), removed);
        Ok(removed)
    }

    fn pause(&self) -> Result<(), QueueError> {
        self.set_paused(true)
    }

    fn resume(&self) -> Result<(), QueueError> {
        self.set_paused(false)
    }

    fn is_paused(&self) -> Result<bool, QueueError> {
        let conn = self.lock()?;
        self.is_paused_in(&conn)
    }

    fn recent(&self, state: JobState, limit: usize) -> Result<Vec<Job>, QueueError> {
        let conn = self.lock()?;
        select_jobs(
            &conn,
            "queue = ?1 AND state = ?2 ORDER BY finished_at DESC, seq DESC LIMIT ?3",
            params![self.name(), state.as_str(), limit as i64],
        )
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let conn = self.lock()?;
        Ok(select_jobs(
            &conn,
            "queue = ?1 AND id = ?2",
            params![self.name(), id.to_string()],
        )?
        .into_iter()
        .next())
    }
}

/// Open a queue database file with WAL enabled
fn open_connection(path: &Path) -> Result<Connection, QueueError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| QueueError::Storage(e.to_string()))?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<(), QueueError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            queue TEXT NOT NULL,
            seq INTEGER NOT NULL,
            dedupe_key TEXT NOT NULL,
            payload TEXT NOT NULL,
            state TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            max_attempts INTEGER NOT NULL,
            available_at INTEGER NOT NULL,
            lease_owner TEXT,
            lease_expires_at INTEGER,
            last_error TEXT,
            enqueued_at INTEGER NOT NULL,
            finished_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_queue_state ON jobs(queue, state, seq);
        CREATE INDEX IF NOT EXISTS idx_jobs_dedupe ON jobs(queue, dedupe_key);
        CREATE TABLE IF NOT EXISTS queue_flags (
            queue TEXT PRIMARY KEY,
            paused INTEGER NOT NULL DEFAULT 0
        );",
    )?;
    Ok(())
}

/// Raw column values of a job row
struct JobRow {
    id: String,
    seq: i64,
    dedupe_key: String,
    payload: String,
    state: String,
    attempts: i64,
    max_attempts: i64,
    available_at: i64,
    lease_owner: Option<String>,
    lease_expires_at: Option<i64>,
    last_error: Option<String>,
    enqueued_at: i64,
    finished_at: Option<i64>,
}

impl JobRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            seq: row.get(1)?,
            dedupe_key: row.get(2)?,
            payload: row.get(3)?,
            state: row.get(4)?,
            attempts: row.get(5)?,
            max_attempts: row.get(6)?,
            available_at: row.get(7)?,
            lease_owner: row.get(8)?,
            lease_expires_at: row.get(9)?,
            last_error: row.get(10)?,
            enqueued_at: row.get(11)?,
            finished_at: row.get(12)?,
        })
    }

    fn into_job(self) -> Result<Job, QueueError> {
        let payload: JobPayload = serde_json::from_str(&self.payload)
            .map_err(|e| QueueError::Storage(format!("bad payload for job {}: {}", self.id, e)))?;
        Ok(Job {
            id: parse_id(&self.id)?,
            stage: payload.stage(),
            sequence: self.seq as u64,
            dedupe_key: self.dedupe_key,
            payload,
            state: parse_state(&self.state)?,
            attempts: self.attempts as u32,
            max_attempts: self.max_attempts as u32,
            available_at: from_millis(self.available_at)?,
            lease_owner: self.lease_owner.map(WorkerId::new),
            lease_expires_at: self.lease_expires_at.map(from_millis).transpose()?,
            last_error: self.last_error,
            enqueued_at: from_millis(self.enqueued_at)?,
            finished_at: self.finished_at.map(from_millis).transpose()?,
        })
    }
}

fn select_jobs(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Job>, QueueError> {
    let sql = format!("SELECT {} FROM jobs WHERE {}", JOB_COLUMNS, filter);
    let mut stmt = conn.prepare(&sql)?;
    let jobs = stmt
        .query_map(params, JobRow::read)?
        .map(|row| row.map_err(QueueError::from).and_then(JobRow::into_job))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(jobs)
}

fn insert_job(conn: &Connection, queue: &str, job: &Job) -> Result<(), QueueError> {
    let payload = serde_json::to_string(&job.payload)
        .map_err(|e| QueueError::Storage(format!("cannot encode payload: {}", e)))?;
    conn.execute(
        &format!(
            "INSERT INTO jobs (queue, {}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            JOB_COLUMNS
        ),
        params![
            queue,
            job.id.to_string(),
            job.sequence as i64,
            job.dedupe_key,
            payload,
            job.state.as_str(),
            job.attempts,
            job.max_attempts,
            job.available_at.timestamp_millis(),
            job.lease_owner.as_ref().map(|w| w.as_str().to_string()),
            job.lease_expires_at.map(|t| t.timestamp_millis()),
            job.last_error,
            job.enqueued_at.timestamp_millis(),
            job.finished_at.map(|t| t.timestamp_millis()),
        ],
    )?;
    Ok(())
}

fn save_job(conn: &Connection, job: &Job) -> Result<(), QueueError> {
    conn.execute(
        "UPDATE jobs SET state = ?2, attempts = ?3, available_at = ?4, lease_owner = ?5,
         lease_expires_at = ?6, last_error = ?7, finished_at = ?8 WHERE id = ?1",
        params![
            job.id.to_string(),
            job.state.as_str(),
            job.attempts,
            job.available_at.timestamp_millis(),
            job.lease_owner.as_ref().map(|w| w.as_str().to_string()),
            job.lease_expires_at.map(|t| t.timestamp_millis()),
            job.last_error,
            job.finished_at.map(|t| t.timestamp_millis()),
        ],
    )?;
    Ok(())
}

fn parse_id(raw: &str) -> Result<JobId, QueueError> {
    raw.parse()
        .map_err(|e| QueueError::Storage(format!("bad job id '{}': {}", raw, e)))
}

fn parse_state(raw: &str) -> Result<JobState, QueueError> {
    raw.parse().map_err(QueueError::Storage)
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, QueueError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| QueueError::Storage(format!("timestamp out of range: {}", ms)))
}
