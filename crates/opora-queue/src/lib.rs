//! Durable job queue with at-least-once, lease-based delivery, plus the
//! worker pool that drains it.
//!
//! Jobs live in SQLite next to the primary data. A lease moves a job to
//! `in_progress` and bumps `attempts`; a worker that dies simply lets the
//! lease expire and the job becomes leasable again. Terminal states are
//! `done`, `failed` (attempts cap) and `cancelled`.

pub mod db;
pub mod error;
pub mod queue;
pub mod types;
pub mod worker;

pub use error::{QueueError, Result};
pub use queue::JobQueue;
pub use types::{Job, JobStatus, JobType};
pub use worker::{JobFailure, JobHandler, WorkerPool};
