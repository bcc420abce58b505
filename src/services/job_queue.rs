use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    clock::Clock,
    error::{AppError, Result},
    models::job::EncryptionJob,
    repositories::job::JobRepository,
};

/// Error recorded on jobs reclaimed by [`JobQueue::requeue_stale`].
pub const VISIBILITY_TIMEOUT_ERROR: &str = "visibility timeout exceeded";

/// Result of reclaiming jobs stuck in `processing`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaleSweep {
    /// Put back to `pending`.
    pub requeued: usize,
    /// Left `failed`, out of retries.
    pub abandoned: usize,
}

/// The encryption job queue: `pending -> processing -> completed | failed`,
/// with `failed -> pending` only through [`JobQueue::retry`].
#[derive(Clone)]
pub struct JobQueue {
    repo: Arc<dyn JobRepository>,
    clock: Arc<dyn Clock>,
}

impl JobQueue {
    pub fn new(repo: Arc<dyn JobRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    pub async fn enqueue(
        &self,
        material_id: Uuid,
        user_id: Uuid,
        device_id: Uuid,
        license_id: Option<Uuid>,
        priority: i32,
    ) -> Result<EncryptionJob> {
        let job = EncryptionJob::new(material_id, user_id, device_id, license_id, priority, self.clock.now());
        self.repo.insert(&job).await?;
        tracing::debug!(job_id = %job.id, priority, "Job enqueued");
        Ok(job)
    }

    /// Claims up to `max_batch` pending jobs, highest priority first and FIFO
    /// within a priority. A job is handed to at most one claimer.
    pub async fn claim_next(&self, max_batch: usize) -> Result<Vec<EncryptionJob>> {
        if max_batch == 0 {
            return Ok(Vec::new());
        }
        let jobs = self.repo.claim_pending(max_batch, self.clock.now()).await?;
        if !jobs.is_empty() {
            tracing::debug!(count = jobs.len(), "Jobs claimed");
        }
        Ok(jobs)
    }

    pub async fn mark_completed(&self, job_id: Uuid) -> Result<()> {
        if self.repo.complete(job_id, self.clock.now()).await? {
            tracing::debug!(%job_id, "Job completed");
            return Ok(());
        }
        Err(self.transition_error(job_id, "complete").await)
    }

    pub async fn mark_failed(&self, job_id: Uuid, error: &str) -> Result<()> {
        if self.repo.fail(job_id, error, self.clock.now()).await? {
            tracing::warn!(%job_id, error, "Job failed");
            return Ok(());
        }
        Err(self.transition_error(job_id, "fail").await)
    }

    /// Moves a failed job back to pending and counts the retry. The queue
    /// tracks the count but does not cap it.
    pub async fn retry(&self, job_id: Uuid) -> Result<()> {
        if self.repo.retry(job_id).await? {
            tracing::debug!(%job_id, "Job requeued for retry");
            return Ok(());
        }
        Err(self.transition_error(job_id, "retry").await)
    }

    /// Maps a refused transition to `NotFound` or `InvalidTransition`.
    async fn transition_error(&self, job_id: Uuid, action: &str) -> AppError {
        match self.repo.find_by_id(job_id).await {
            Ok(None) => AppError::NotFound,
            Ok(Some(job)) => AppError::InvalidTransition(format!(
                "cannot {} job {} in status {}",
                action,
                job_id,
                job.status.as_str()
            )),
            Err(e) => e,
        }
    }

    pub async fn get(&self, job_id: Uuid) -> Result<EncryptionJob> {
        self.repo.find_by_id(job_id).await?.ok_or(AppError::NotFound)
    }

    pub async fn list_for_license(&self, license_id: Uuid) -> Result<Vec<EncryptionJob>> {
        self.repo.list_by_license(license_id).await
    }

    /// Reclaims jobs that have been `processing` for longer than
    /// `visibility_timeout`: each is failed, then retried if it still has
    /// retries left.
    pub async fn requeue_stale(&self, visibility_timeout: Duration, max_retries: i32) -> Result<StaleSweep> {
        let now = self.clock.now();
        let stale = self
            .repo
            .fail_stale(now - visibility_timeout, VISIBILITY_TIMEOUT_ERROR, now)
            .await?;

        let mut sweep = StaleSweep::default();
        for job in stale {
            if job.retry_count < max_retries && self.repo.retry(job.id).await? {
                sweep.requeued += 1;
            } else {
                tracing::warn!(job_id = %job.id, retry_count = job.retry_count, "Stale job abandoned");
                sweep.abandoned += 1;
            }
        }

        if sweep != StaleSweep::default() {
            tracing::info!(requeued = sweep.requeued, abandoned = sweep.abandoned, "Reclaimed stale jobs");
        }
        Ok(sweep)
    }

    /// Deletes completed jobs finished before `older_than`. Failed jobs stay.
    pub async fn reap(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let count = self.repo.delete_completed_before(older_than).await?;
        if count > 0 {
            tracing::info!(count, "🧹 Reaped completed jobs");
        }
        Ok(count)
    }
}
