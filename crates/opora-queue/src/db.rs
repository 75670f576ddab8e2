use rusqlite::{Connection, Result};

/// Initialise the jobs table. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS jobs (
            job_id          TEXT PRIMARY KEY,
            job_type        TEXT NOT NULL,
            payload         TEXT NOT NULL,
            status          TEXT NOT NULL DEFAULT 'pending',
            attempts        INTEGER NOT NULL DEFAULT 0,
            next_visible_at INTEGER NOT NULL,
            created_at      INTEGER NOT NULL,
            updated_at      INTEGER NOT NULL,
            job_key         TEXT,
            last_error      TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_lease
            ON jobs(status, next_visible_at, created_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_key
            ON jobs(job_type, job_key);",
    )
}
