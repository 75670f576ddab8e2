use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OpenFlags};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::init_db;
use crate::error::{QueueError, Result};
use crate::types::{Job, JobStatus, JobType};

/// Durable queue handle. Opens its own connection so producers and the
/// worker pool never contend with the primary store's lock.
pub struct JobQueue {
    db: Mutex<Connection>,
    max_attempts: u32,
    lease_ms: i64,
}

impl JobQueue {
    pub fn open(path: impl AsRef<Path>, max_attempts: u32, lease_ms: i64) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            max_attempts,
            lease_ms,
        })
    }

    pub fn open_in_memory(max_attempts: u32, lease_ms: i64) -> Result<Self> {
        let conn = Connection::open_with_flags(
            "file:oporaq?mode=memory&cache=private",
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            max_attempts,
            lease_ms,
        })
    }

    /// Enqueue a job, immediately visible.
    pub fn enqueue(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        job_key: Option<&str>,
    ) -> Result<Job> {
        let db = self.db.lock().unwrap();
        let now = opora_core::now_ms();
        let job_id = Uuid::new_v4().to_string();
        db.execute(
            "INSERT INTO jobs
             (job_id, job_type, payload, status, attempts, next_visible_at,
              created_at, updated_at, job_key)
             VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4, ?4, ?5)",
            rusqlite::params![
                job_id,
                job_type.to_string(),
                payload.to_string(),
                now,
                job_key
            ],
        )?;
        debug!(job_id = %job_id, job_type = %job_type, "job enqueued");
        Ok(Job {
            job_id,
            job_type,
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            next_visible_at: now,
            created_at: now,
            job_key: job_key.map(String::from),
        })
    }

    /// Lease the oldest visible pending job for `lease_ms`.
    ///
    /// Expired `in_progress` leases are recovered to `pending` first, so a
    /// crashed worker's job is picked up here. A job leased past the
    /// attempts cap goes terminal `failed` instead of being handed out.
    pub fn lease(&self, worker_id: &str) -> Result<Option<Job>> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let now = opora_core::now_ms();

        // Lease recovery: the one legal pending <- in_progress transition.
        let recovered = tx.execute(
            "UPDATE jobs SET status = 'pending', updated_at = ?1
             WHERE status = 'in_progress' AND next_visible_at <= ?1",
            [now],
        )?;
        if recovered > 0 {
            warn!(count = recovered, "expired leases recovered");
        }

        loop {
            let row: Option<(String, String, String, u32, i64, Option<String>)> = tx
                .query_row(
                    "SELECT job_id, job_type, payload, attempts, created_at, job_key
                     FROM jobs
                     WHERE status = 'pending' AND next_visible_at <= ?1
                     ORDER BY created_at, job_id
                     LIMIT 1",
                    [now],
                    |r| {
                        Ok((
                            r.get(0)?,
                            r.get(1)?,
                            r.get(2)?,
                            r.get(3)?,
                            r.get(4)?,
                            r.get(5)?,
                        ))
                    },
                )
                .ok();

            let (job_id, type_str, payload_str, attempts, created_at, job_key) = match row {
                Some(r) => r,
                None => {
                    tx.commit()?;
                    return Ok(None);
                }
            };

            let next_attempts = attempts + 1;
            if next_attempts > self.max_attempts {
                tx.execute(
                    "UPDATE jobs SET status = 'failed', updated_at = ?1,
                            last_error = 'attempts cap exceeded'
                     WHERE job_id = ?2",
                    rusqlite::params![now, job_id],
                )?;
                warn!(job_id = %job_id, attempts, "job failed: attempts cap");
                continue;
            }

            tx.execute(
                "UPDATE jobs SET status = 'in_progress', attempts = ?1,
                        next_visible_at = ?2, updated_at = ?3
                 WHERE job_id = ?4",
                rusqlite::params![next_attempts, now + self.lease_ms, now, job_id],
            )?;
            tx.commit()?;

            let job_type: JobType = type_str
                .parse()
                .map_err(QueueError::CorruptRow)?;
            let payload = serde_json::from_str(&payload_str)?;
            debug!(job_id = %job_id, worker = %worker_id, attempt = next_attempts, "job leased");
            return Ok(Some(Job {
                job_id,
                job_type,
                payload,
                status: JobStatus::InProgress,
                attempts: next_attempts,
                next_visible_at: now + self.lease_ms,
                created_at,
                job_key,
            }));
        }
    }

    pub fn complete(&self, job_id: &str) -> Result<()> {
        self.finish(job_id, JobStatus::Done, None)
    }

    /// Record a failed attempt. Below the attempts cap the job returns to
    /// `pending` after `backoff_ms`; at the cap it goes terminal `failed`.
    pub fn fail(&self, job_id: &str, reason: &str, backoff_ms: i64) -> Result<()> {
        let db = self.db.lock().unwrap();
        let now = opora_core::now_ms();
        let attempts: u32 = db
            .query_row(
                "SELECT attempts FROM jobs WHERE job_id = ?1",
                [job_id],
                |r| r.get(0),
            )
            .map_err(|_| QueueError::JobNotFound {
                id: job_id.to_string(),
            })?;

        if attempts >= self.max_attempts {
            db.execute(
                "UPDATE jobs SET status = 'failed', updated_at = ?1, last_error = ?2
                 WHERE job_id = ?3",
                rusqlite::params![now, reason, job_id],
            )?;
            warn!(job_id = %job_id, attempts, %reason, "job failed terminally");
        } else {
            db.execute(
                "UPDATE jobs SET status = 'pending', next_visible_at = ?1,
                        updated_at = ?2, last_error = ?3
                 WHERE job_id = ?4",
                rusqlite::params![now + backoff_ms, now, reason, job_id],
            )?;
            debug!(job_id = %job_id, attempts, backoff_ms, "job will retry");
        }
        Ok(())
    }

    /// Mark a job terminally failed regardless of remaining attempts.
    pub fn fail_terminal(&self, job_id: &str, reason: &str) -> Result<()> {
        self.finish(job_id, JobStatus::Failed, Some(reason))
    }

    /// Cancel a job. Effective only while `pending`; an in-progress job
    /// finishes its current run and is completed by its worker.
    pub fn cancel(&self, job_id: &str) -> Result<bool> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE jobs SET status = 'cancelled', updated_at = ?1
             WHERE job_id = ?2 AND status = 'pending'",
            rusqlite::params![opora_core::now_ms(), job_id],
        )?;
        Ok(n > 0)
    }

    /// Cancel all pending jobs of one type sharing a job key. Returns the
    /// number cancelled.
    pub fn cancel_by_key(&self, job_type: JobType, job_key: &str) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE jobs SET status = 'cancelled', updated_at = ?1
             WHERE job_type = ?2 AND job_key = ?3 AND status = 'pending'",
            rusqlite::params![opora_core::now_ms(), job_type.to_string(), job_key],
        )?;
        if n > 0 {
            info!(job_type = %job_type, key = %job_key, count = n, "jobs cancelled by key");
        }
        Ok(n)
    }

    /// Pending + in-progress depth, the backpressure signal.
    pub fn depth(&self) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let n: i64 = db.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status IN ('pending', 'in_progress')",
            [],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    /// Delete finished jobs older than `retention_ms`. Reconciler duty.
    pub fn gc_finished(&self, retention_ms: i64) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let cutoff = opora_core::now_ms() - retention_ms;
        let n = db.execute(
            "DELETE FROM jobs
             WHERE status IN ('done', 'failed', 'cancelled') AND updated_at < ?1",
            [cutoff],
        )?;
        Ok(n)
    }

    pub fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let db = self.db.lock().unwrap();
        let row = db.query_row(
            "SELECT job_id, job_type, payload, status, attempts, next_visible_at,
                    created_at, job_key
             FROM jobs WHERE job_id = ?1",
            [job_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, u32>(4)?,
                    r.get::<_, i64>(5)?,
                    r.get::<_, i64>(6)?,
                    r.get::<_, Option<String>>(7)?,
                ))
            },
        );
        let (job_id, type_str, payload_str, status_str, attempts, next_visible_at, created_at, job_key) =
            match row {
                Ok(r) => r,
                Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
                Err(e) => return Err(QueueError::Database(e)),
            };
        Ok(Some(Job {
            job_id,
            job_type: type_str.parse().map_err(QueueError::CorruptRow)?,
            payload: serde_json::from_str(&payload_str)?,
            status: status_str.parse().map_err(QueueError::CorruptRow)?,
            attempts,
            next_visible_at,
            created_at,
            job_key,
        }))
    }

    fn finish(&self, job_id: &str, status: JobStatus, reason: Option<&str>) -> Result<()> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE jobs SET status = ?1, updated_at = ?2,
                    last_error = COALESCE(?3, last_error)
             WHERE job_id = ?4",
            rusqlite::params![status.to_string(), opora_core::now_ms(), reason, job_id],
        )?;
        if n == 0 {
            return Err(QueueError::JobNotFound {
                id: job_id.to_string(),
            });
        }
        Ok(())
    }
}
