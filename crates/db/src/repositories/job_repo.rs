//! Repository for the `generation_jobs` table.
//!
//! Uses `JobStatus` from `models::status` for every status transition.
//! Claiming is a plain read-then-update: a single worker instance is
//! assumed, so no row locking is performed.

use genq_core::types::DbId;
use sqlx::PgPool;

use crate::models::job::GenerationJob;
use crate::models::status::JobStatus;

/// Column list for `generation_jobs` queries.
const COLUMNS: &str = "\
    id, status_id, parameters, prompt_id, \
    progress_percent, progress_stage, \
    elapsed_secs, estimated_total_secs, estimated_remaining_secs, \
    result_urls, error_message, \
    created_at, started_at, completed_at, updated_at";

/// A progress snapshot to persist on a running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressRecord<'a> {
    pub percent: i16,
    pub stage: &'a str,
    pub elapsed_secs: i32,
    pub estimated_total_secs: i32,
    pub estimated_remaining_secs: i32,
}

/// Provides queries and status transitions for generation jobs.
pub struct JobRepo;

impl JobRepo {
    /// Read the oldest pending job, if any.
    pub async fn find_next_pending(pool: &PgPool) -> Result<Option<GenerationJob>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM generation_jobs \
             WHERE status_id = $1 \
             ORDER BY created_at ASC, id ASC \
             LIMIT 1"
        );
        sqlx::query_as::<_, GenerationJob>(&query)
            .bind(JobStatus::Pending.id())
            .fetch_optional(pool)
            .await
    }

    /// Move a job to `Processing` and reset its progress columns.
    pub async fn mark_processing(pool: &PgPool, job_id: DbId) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE generation_jobs \
             SET status_id = $2, started_at = NOW(), progress_percent = 0, \
                 progress_stage = NULL, elapsed_secs = 0, \
                 estimated_total_secs = 0, estimated_remaining_secs = 0 \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(JobStatus::Processing.id())
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Record the ComfyUI prompt id the job was submitted as.
    pub async fn set_prompt_id(
        pool: &PgPool,
        job_id: DbId,
        prompt_id: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE generation_jobs SET prompt_id = $2 WHERE id = $1")
            .bind(job_id)
            .bind(prompt_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Persist a progress snapshot on a processing job.
    ///
    /// Rows that already reached a terminal status are left untouched so a
    /// late update cannot overwrite the final state.
    pub async fn update_progress(
        pool: &PgPool,
        job_id: DbId,
        progress: &ProgressRecord<'_>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE generation_jobs \
             SET progress_percent = $2, progress_stage = $3, elapsed_secs = $4, \
                 estimated_total_secs = $5, estimated_remaining_secs = $6 \
             WHERE id = $1 AND status_id = $7",
        )
        .bind(job_id)
        .bind(progress.percent)
        .bind(progress.stage)
        .bind(progress.elapsed_secs)
        .bind(progress.estimated_total_secs)
        .bind(progress.estimated_remaining_secs)
        .bind(JobStatus::Processing.id())
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Mark a job as completed with the public URLs of its outputs.
    pub async fn complete(
        pool: &PgPool,
        job_id: DbId,
        result_urls: &[String],
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE generation_jobs \
             SET status_id = $2, result_urls = $3, completed_at = NOW(), \
                 progress_percent = 100, progress_stage = 'Complete', \
                 estimated_remaining_secs = 0 \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(JobStatus::Completed.id())
        .bind(serde_json::json!(result_urls))
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Mark a job as failed. No automatic retry is performed.
    pub async fn fail(pool: &PgPool, job_id: DbId, error: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE generation_jobs \
             SET status_id = $2, error_message = $3, completed_at = NOW() \
             WHERE id = $1",
        )
        .bind(job_id)
        .bind(JobStatus::Failed.id())
        .bind(error)
        .execute(pool)
        .await?;
        Ok(())
    }
}
