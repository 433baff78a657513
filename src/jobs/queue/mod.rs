
use anyhow::Context as _;
use chrono::{Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::config::JobConfig;
use crate::database::Database;
use crate::database::sqlite::queries::placeholders;
use crate::database::sqlite::{EmbeddingJob, JobStatus};
use crate::{RagError, Result};

/// Durable embedding work queue backed by the `embedding_jobs` table.
///
/// Jobs move `pending -> processing -> completed`, or back to `pending` with
/// exponential backoff when a retryable failure occurs. A retried job is not
/// claimable again until its `run_after` timestamp has passed. Non-retryable
/// failures and exhausted retries land in `failed`.
#[derive(Clone)]
pub struct JobQueue {
    database: Database,
    config: JobConfig,
}

/// Per-status job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobQueue {
    #[inline]
    pub fn new(database: Database, config: JobConfig) -> Self {
        Self { database, config }
    }

    fn pool(&self) -> &SqlitePool {
        self.database.pool()
    }

    /// Queue an embedding job for one chunk.
    #[inline]
    pub async fn enqueue(&self, context_item_id: i64) -> Result<i64> {
        let now = Utc::now().naive_utc();
        let id = sqlx::query(
            "INSERT INTO embedding_jobs (context_item_id, status, retry_count, created_date)
             VALUES (?, 'pending', 0, ?)",
        )
        .bind(context_item_id)
        .bind(now)
        .execute(self.pool())
        .await
        .context("Failed to enqueue embedding job")?
        .last_insert_rowid();

        debug!("Enqueued embedding job {} for context item {}", id, context_item_id);
        Ok(id)
    }

    /// Queue an embedding job for every chunk of a context. Returns the
    /// number of jobs created.
    #[inline]
    pub async fn enqueue_for_context(&self, context_id: i64) -> Result<u64> {
        let now = Utc::now().naive_utc();
        let created = sqlx::query(
            "INSERT INTO embedding_jobs (context_item_id, status, retry_count, created_date)
             SELECT id, 'pending', 0, ? FROM context_items WHERE context_id = ?",
        )
        .bind(now)
        .bind(context_id)
        .execute(self.pool())
        .await
        .context("Failed to enqueue embedding jobs for context")?
        .rows_affected();

        info!("Enqueued {} embedding jobs for context {}", created, context_id);
        Ok(created)
    }

    #[inline]
    pub async fn get(&self, job_id: i64) -> Result<Option<EmbeddingJob>> {
        let job = sqlx::query_as::<_, EmbeddingJob>("SELECT * FROM embedding_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(self.pool())
            .await
            .context("Failed to get embedding job")?;
        Ok(job)
    }

    /// Claim up to `batch_size` runnable jobs, marking them `processing`.
    ///
    /// A job is runnable when it is `pending` and its backoff (if any) has
    /// elapsed. The select and the status flip happen in one transaction so
    /// concurrent workers never claim the same job.
    pub async fn next_batch(&self) -> Result<Vec<EmbeddingJob>> {
        let now = Utc::now().naive_utc();

        let mut tx = self
            .pool()
            .begin()
            .await
            .context("Failed to begin job claim transaction")?;

        let jobs = sqlx::query_as::<_, EmbeddingJob>(
            "SELECT * FROM embedding_jobs
             WHERE status = 'pending' AND (run_after IS NULL OR run_after <= ?)
             ORDER BY created_date, id
             LIMIT ?",
        )
        .bind(now)
        .bind(self.config.batch_size as i64)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to fetch pending embedding jobs")?;

        if jobs.is_empty() {
            tx.commit()
                .await
                .context("Failed to commit job claim transaction")?;
            return Ok(jobs);
        }

        let sql = format!(
            "UPDATE embedding_jobs SET status = 'processing', started_date = ? WHERE id IN ({})",
            placeholders(jobs.len())
        );
        let mut query = sqlx::query(&sql).bind(now);
        for job in &jobs {
            query = query.bind(job.id);
        }
        query
            .execute(&mut *tx)
            .await
            .context("Failed to mark embedding jobs as processing")?;

        tx.commit()
            .await
            .context("Failed to commit job claim transaction")?;

        debug!("Claimed {} embedding jobs", jobs.len());
        Ok(jobs)
    }

    #[inline]
    pub async fn mark_completed(&self, job_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE embedding_jobs SET status = 'completed', error_message = NULL WHERE id = ?",
        )
        .bind(job_id)
        .execute(self.pool())
        .await
        .context("Failed to mark embedding job as completed")?;
        Ok(())
    }

    /// Record a job failure and decide its fate: retryable errors send the
    /// job back to `pending` with backoff until `max_retries` is exhausted,
    /// everything else is a terminal `failed`. Returns the resulting status.
    pub async fn mark_failed(&self, job_id: i64, error: &RagError) -> Result<JobStatus> {
        let job = self.get(job_id).await?.ok_or_else(|| {
            RagError::NotFound(format!("Embedding job {job_id} not found"))
        })?;

        let message = error.to_string();

        if error.is_retryable() && job.retry_count < i64::from(self.config.max_retries) {
            let delay = self.retry_delay_seconds(job.retry_count);
            let run_after = Utc::now().naive_utc() + Duration::seconds(delay);

            sqlx::query(
                "UPDATE embedding_jobs
                 SET status = 'pending', retry_count = retry_count + 1,
                     error_message = ?, run_after = ?, started_date = NULL
                 WHERE id = ?",
            )
            .bind(&message)
            .bind(run_after)
            .bind(job_id)
            .execute(self.pool())
            .await
            .context("Failed to schedule embedding job retry")?;

            warn!(
                "Embedding job {} failed (attempt {}), retrying in {}s: {}",
                job_id,
                job.retry_count + 1,
                delay,
                message
            );
            Ok(JobStatus::Pending)
        } else {
            sqlx::query(
                "UPDATE embedding_jobs SET status = 'failed', error_message = ? WHERE id = ?",
            )
            .bind(&message)
            .bind(job_id)
            .execute(self.pool())
            .await
            .context("Failed to mark embedding job as failed")?;

            warn!("Embedding job {} permanently failed: {}", job_id, message);
            Ok(JobStatus::Failed)
        }
    }

    /// Backoff before retry number `retry_count + 1`: `base * 2^retry_count`.
    fn retry_delay_seconds(&self, retry_count: i64) -> i64 {
        let base = self.config.retry_base_delay_seconds as i64;
        base.saturating_mul(1_i64 << retry_count.clamp(0, 32))
    }

    #[inline]
    pub async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM embedding_jobs GROUP BY status")
                .fetch_all(self.pool())
                .await
                .context("Failed to read queue stats")?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = count as u64;
            match status.as_str() {
                "pending" => stats.pending = count,
                "processing" => stats.processing = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                other => warn!("Unknown embedding job status in queue: {}", other),
            }
        }
        Ok(stats)
    }

    /// Reset jobs stuck in `processing` longer than the configured timeout
    /// back to `pending`, recovering from worker crashes.
    #[inline]
    pub async fn reset_stuck(&self) -> Result<u64> {
        let cutoff = Utc::now().naive_utc()
            - Duration::seconds(self.config.processing_timeout_seconds as i64);

        let reset = sqlx::query(
            "UPDATE embedding_jobs SET status = 'pending', started_date = NULL
             WHERE status = 'processing' AND started_date <= ?",
        )
        .bind(cutoff)
        .execute(self.pool())
        .await
        .context("Failed to reset stuck embedding jobs")?
        .rows_affected();

        if reset > 0 {
            warn!("Reset {} stuck embedding jobs to pending", reset);
        }
        Ok(reset)
    }

    /// Delete terminal jobs older than the configured cleanup age. Returns
    /// the number of rows removed.
    #[inline]
    pub async fn cleanup_old(&self) -> Result<u64> {
        let cutoff =
            Utc::now().naive_utc() - Duration::seconds(self.config.cleanup_age_seconds as i64);

        let removed = sqlx::query(
            "DELETE FROM embedding_jobs
             WHERE status IN ('completed', 'failed') AND created_date <= ?",
        )
        .bind(cutoff)
        .execute(self.pool())
        .await
        .context("Failed to clean up old embedding jobs")?
        .rows_affected();

        if removed > 0 {
            info!("Cleaned up {} old embedding jobs", removed);
        }
        Ok(removed)
    }
}
