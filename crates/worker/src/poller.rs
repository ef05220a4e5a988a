//! Job polling loop.
//!
//! Polls `generation_jobs` for the oldest pending row every `poll_interval`
//! and runs it to completion before polling again. A single worker is
//! assumed: the read-then-update claim takes no row locks.

use std::time::Duration;

use genq_db::repositories::JobRepo;
use sqlx::PgPool;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::processor::JobProcessor;

/// Long-lived polling task.
pub struct JobPoller {
    pool: PgPool,
    processor: JobProcessor,
    poll_interval: Duration,
}

impl JobPoller {
    pub fn new(pool: PgPool, processor: JobProcessor, poll_interval: Duration) -> Self {
        Self {
            pool,
            processor,
            poll_interval,
        }
    }

    /// Run until `cancel` fires.
    ///
    /// Cancellation is observed between jobs; a job already in progress is
    /// finished (or times out) first.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Job poller started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Job poller shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::error!(error = %e, "Poll cycle failed");
                    }
                }
            }
        }
    }

    /// One poll cycle. Returns `true` if a job was processed.
    pub async fn poll_once(&self) -> Result<bool, sqlx::Error> {
        let Some(job) = JobRepo::find_next_pending(&self.pool).await? else {
            return Ok(false);
        };

        tracing::info!(job_id = job.id, "Picked up pending job");
        JobRepo::mark_processing(&self.pool, job.id).await?;
        self.processor.handle(&job).await?;
        Ok(true)
    }
}
