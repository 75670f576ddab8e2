use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::queue::JobQueue;
use crate::types::Job;

/// How a job run ended badly. Transient failures are retried with backoff
/// up to the attempts cap; terminal ones fail the job immediately.
#[derive(Debug)]
pub struct JobFailure {
    pub message: String,
    pub terminal: bool,
}

impl JobFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            terminal: false,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            terminal: true,
        }
    }
}

/// Executes one leased job. Implementations check `cancel` between
/// external calls; a cancelled run should return quickly (the job is
/// completed or retried per its result as usual).
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job, cancel: &CancellationToken) -> Result<(), JobFailure>;
}

/// Pool of N independent worker loops draining the queue.
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    workers: usize,
    poll_interval: Duration,
    backoff_base_ms: i64,
    high_watermark: usize,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<JobQueue>,
        handler: Arc<dyn JobHandler>,
        workers: usize,
        poll_interval_ms: u64,
        high_watermark: usize,
    ) -> Self {
        Self {
            queue,
            handler,
            workers: workers.max(1),
            poll_interval: Duration::from_millis(poll_interval_ms.max(10)),
            backoff_base_ms: poll_interval_ms.max(10) as i64 * 4,
            high_watermark,
        }
    }

    /// Spawn the worker loops. They run until `shutdown` broadcasts `true`;
    /// the returned handles complete once every loop has drained out.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|i| {
                let queue = Arc::clone(&self.queue);
                let handler = Arc::clone(&self.handler);
                let mut shutdown = shutdown.clone();
                let worker_id = format!("worker-{i}");
                let poll_interval = self.poll_interval;
                let backoff_base_ms = self.backoff_base_ms;
                let high_watermark = self.high_watermark;
                tokio::spawn(async move {
                    info!(worker = %worker_id, "worker started");
                    let cancel = CancellationToken::new();
                    // Propagate shutdown into in-flight runs: handlers check
                    // their child token between external calls.
                    {
                        let cancel = cancel.clone();
                        let mut shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            while shutdown.changed().await.is_ok() {
                                if *shutdown.borrow() {
                                    cancel.cancel();
                                    break;
                                }
                            }
                        });
                    }
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }
                        let job = match queue.lease(&worker_id) {
                            Ok(j) => j,
                            Err(e) => {
                                error!(worker = %worker_id, "lease failed: {e}");
                                None
                            }
                        };

                        let Some(job) = job else {
                            // Idle: wait for the poll interval or shutdown,
                            // whichever comes first.
                            tokio::select! {
                                _ = tokio::time::sleep(poll_interval) => {}
                                _ = shutdown.changed() => {}
                            }
                            continue;
                        };

                        let run_cancel = cancel.child_token();
                        match handler.handle(&job, &run_cancel).await {
                            Ok(()) => {
                                if let Err(e) = queue.complete(&job.job_id) {
                                    error!(job_id = %job.job_id, "complete failed: {e}");
                                }
                            }
                            Err(f) if f.terminal => {
                                warn!(job_id = %job.job_id, error = %f.message, "job terminal failure");
                                if let Err(e) = queue.fail_terminal(&job.job_id, &f.message) {
                                    error!(job_id = %job.job_id, "fail_terminal failed: {e}");
                                }
                            }
                            Err(f) => {
                                // Exponential backoff on the attempt number.
                                let backoff =
                                    backoff_base_ms << (job.attempts.min(6).saturating_sub(1));
                                warn!(
                                    job_id = %job.job_id,
                                    attempt = job.attempts,
                                    backoff_ms = backoff,
                                    error = %f.message,
                                    "job transient failure"
                                );
                                if let Err(e) = queue.fail(&job.job_id, &f.message, backoff) {
                                    error!(job_id = %job.job_id, "fail failed: {e}");
                                }
                            }
                        }

                        // Backpressure: a deep queue usually means the LLM or
                        // transport is saturated, so slow the drain instead
                        // of hammering them.
                        if queue.depth().unwrap_or(0) > high_watermark {
                            tokio::time::sleep(poll_interval).await;
                        }
                    }
                    cancel.cancel();
                    info!(worker = %worker_id, "worker stopped");
                })
            })
            .collect()
    }
}
