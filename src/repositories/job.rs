use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::{
    error::Result,
    models::job::{EncryptionJob, JobStatus},
};

/// Persistence for encryption jobs. Each transition is conditioned on the
/// current status; `false` means the job was not in the required state.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn insert(&self, job: &EncryptionJob) -> Result<()>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<EncryptionJob>>;

    /// Jobs serving a license, newest first.
    async fn list_by_license(&self, license_id: Uuid) -> Result<Vec<EncryptionJob>>;

    /// Atomically moves up to `limit` pending jobs to processing, in
    /// `(priority, created_at)` order. Jobs taken by a concurrent claimer are
    /// skipped, never returned twice.
    async fn claim_pending(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<EncryptionJob>>;

    async fn complete(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    async fn fail(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<bool>;

    /// failed -> pending, incrementing `retry_count`.
    async fn retry(&self, id: Uuid) -> Result<bool>;

    /// Fails every processing job started before `started_before`; returns
    /// the jobs as they are after the transition.
    async fn fail_stale(
        &self,
        started_before: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<EncryptionJob>>;

    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// A helper function to map a `tokio_postgres::Row` to an `EncryptionJob`.
fn row_to_job(row: &Row) -> Result<EncryptionJob> {
    let status: JobStatus = row.try_get("status")?;
    Ok(EncryptionJob {
        id: row.try_get("id")?,
        material_id: row.try_get("material_id")?,
        user_id: row.try_get("user_id")?,
        device_id: row.try_get("device_id")?,
        license_id: row.try_get("license_id")?,
        priority: row.try_get("priority")?,
        status,
        error: row.try_get("error")?,
        retry_count: row.try_get("retry_count")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

/// Sorts claimed rows back into service order; `RETURNING` does not keep it.
fn in_service_order(mut jobs: Vec<EncryptionJob>) -> Vec<EncryptionJob> {
    jobs.sort_by(|a, b| (a.priority, a.created_at).cmp(&(b.priority, b.created_at)));
    jobs
}

/// Postgres-backed job repository over `offline_encryption_jobs`.
#[derive(Clone)]
pub struct PgJobRepository {
    pool: Pool,
}

impl PgJobRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn insert(&self, job: &EncryptionJob) -> Result<()> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                INSERT INTO offline_encryption_jobs (
                    id, material_id, user_id, device_id, license_id, priority,
                    status, error, retry_count, created_at, started_at, completed_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .await?;
        client
            .execute(
                &stmt,
                &[
                    &job.id,
                    &job.material_id,
                    &job.user_id,
                    &job.device_id,
                    &job.license_id,
                    &job.priority,
                    &job.status,
                    &job.error,
                    &job.retry_count,
                    &job.created_at,
                    &job.started_at,
                    &job.completed_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<EncryptionJob>> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                SELECT id, material_id, user_id, device_id, license_id, priority, status,
                       error, retry_count, created_at, started_at, completed_at
                FROM offline_encryption_jobs
                WHERE id = $1
                "#,
            )
            .await?;
        let row = client.query_opt(&stmt, &[&id]).await?;
        row.map(|r| row_to_job(&r)).transpose()
    }

    async fn list_by_license(&self, license_id: Uuid) -> Result<Vec<EncryptionJob>> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                SELECT id, material_id, user_id, device_id, license_id, priority, status,
                       error, retry_count, created_at, started_at, completed_at
                FROM offline_encryption_jobs
                WHERE license_id = $1
                ORDER BY created_at DESC
                "#,
            )
            .await?;
        let rows = client.query(&stmt, &[&license_id]).await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn claim_pending(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<EncryptionJob>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                UPDATE offline_encryption_jobs
                SET status = 'processing', started_at = $2
                WHERE id IN (
                    SELECT id FROM offline_encryption_jobs
                    WHERE status = 'pending'
                    ORDER BY priority ASC, created_at ASC
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                )
                AND status = 'pending'
                RETURNING id, material_id, user_id, device_id, license_id, priority, status,
                          error, retry_count, created_at, started_at, completed_at
                "#,
            )
            .await?;
        let rows = client.query(&stmt, &[&limit, &now]).await?;
        let jobs = rows.iter().map(row_to_job).collect::<Result<Vec<_>>>()?;
        Ok(in_service_order(jobs))
    }

    async fn complete(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                UPDATE offline_encryption_jobs
                SET status = 'completed', completed_at = $2
                WHERE id = $1 AND status = 'processing'
                "#,
            )
            .await?;
        Ok(client.execute(&stmt, &[&id, &now]).await? == 1)
    }

    async fn fail(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<bool> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                UPDATE offline_encryption_jobs
                SET status = 'failed', error = $2, completed_at = $3
                WHERE id = $1 AND status = 'processing'
                "#,
            )
            .await?;
        Ok(client.execute(&stmt, &[&id, &error, &now]).await? == 1)
    }

    async fn retry(&self, id: Uuid) -> Result<bool> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                UPDATE offline_encryption_jobs
                SET status = 'pending', retry_count = retry_count + 1,
                    started_at = NULL, completed_at = NULL, error = NULL
                WHERE id = $1 AND status = 'failed'
                "#,
            )
            .await?;
        Ok(client.execute(&stmt, &[&id]).await? == 1)
    }

    async fn fail_stale(
        &self,
        started_before: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<EncryptionJob>> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                UPDATE offline_encryption_jobs
                SET status = 'failed', error = $2, completed_at = $3
                WHERE status = 'processing' AND started_at < $1
                RETURNING id, material_id, user_id, device_id, license_id, priority, status,
                          error, retry_count, created_at, started_at, completed_at
                "#,
            )
            .await?;
        let rows = client.query(&stmt, &[&started_before, &error, &now]).await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                DELETE FROM offline_encryption_jobs
                WHERE status = 'completed' AND completed_at < $1
                "#,
            )
            .await?;
        Ok(client.execute(&stmt, &[&cutoff]).await?)
    }
}
