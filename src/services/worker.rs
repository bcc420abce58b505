use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use uuid::Uuid;

use crate::{
    clock::Clock,
    config::Config,
    crypto::{aes, kek::KeyWrapper},
    error::{AppError, Result},
    models::{
        audit::{AuditAction, AuditRecord},
        cek::DeviceBinding,
        job::EncryptionJob,
    },
    services::{
        audit::AuditForwarder,
        job_queue::{JobQueue, StaleSweep},
        key_store::KeyStore,
        ledger::LicenseLedger,
    },
};

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Jobs processed at the same time.
    pub concurrency: usize,
    /// Jobs claimed per poll.
    pub batch_size: usize,
    /// Sleep between polls that found nothing to do.
    pub poll_interval: Duration,
    /// A failed job is retried while its `retry_count` is below this.
    pub max_retries: i32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
            max_retries: 3,
        }
    }
}

impl From<&Config> for WorkerConfig {
    fn from(config: &Config) -> Self {
        Self {
            concurrency: config.worker_concurrency,
            batch_size: config.worker_batch_size,
            poll_interval: config.worker_poll_interval,
            max_retries: config.job_max_retries,
        }
    }
}

/// What a job ended up doing to the key store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyWork {
    Generated,
    Rewrapped,
    AlreadyCurrent,
    /// License gone or revoked; nothing produced.
    Skipped,
}

/// Drains the job queue: claims jobs, produces wrapped CEKs and finalizes
/// each job.
#[derive(Clone)]
pub struct EncryptionWorker {
    queue: JobQueue,
    ledger: LicenseLedger,
    keys: KeyStore,
    wrapper: Arc<dyn KeyWrapper>,
    clock: Arc<dyn Clock>,
    audit: Option<AuditForwarder>,
    config: WorkerConfig,
}

impl EncryptionWorker {
    pub fn new(
        queue: JobQueue,
        ledger: LicenseLedger,
        keys: KeyStore,
        wrapper: Arc<dyn KeyWrapper>,
        clock: Arc<dyn Clock>,
        audit: Option<AuditForwarder>,
        config: WorkerConfig,
    ) -> Self {
        Self { queue, ledger, keys, wrapper, clock, audit, config }
    }

    /// Claims one batch and processes it.
    ///
    /// # Returns
    ///
    /// The number of jobs claimed.
    pub async fn run_once(&self) -> Result<usize> {
        let jobs = self.queue.claim_next(self.config.batch_size).await?;
        let claimed = jobs.len();
        if claimed == 0 {
            return Ok(0);
        }

        let permits = Semaphore::new(self.config.concurrency.max(1));
        let tasks = jobs.into_iter().map(|job| {
            let permits = &permits;
            async move {
                match permits.acquire().await {
                    Ok(_permit) => self.handle(job).await,
                    Err(e) => tracing::error!(job_id = %job.id, "Worker semaphore closed: {}", e),
                }
            }
        });
        futures::future::join_all(tasks).await;

        Ok(claimed)
    }

    /// Polls until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            concurrency = self.config.concurrency,
            batch_size = self.config.batch_size,
            "🚀 Encryption worker started"
        );
        while !*shutdown.borrow() {
            let idle = match self.run_once().await {
                Ok(claimed) => claimed == 0,
                Err(e) => {
                    tracing::error!("❌ Worker poll failed: {}", e);
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        tracing::info!("Encryption worker stopped");
    }

    async fn handle(&self, job: EncryptionJob) {
        let job_id = job.id;
        match self.produce_key(&job).await {
            Ok(work) => {
                if let Err(e) = self.queue.mark_completed(job_id).await {
                    // Typically reclaimed by the sweeper after running past the visibility timeout.
                    tracing::warn!(%job_id, "Could not complete job: {}", e);
                    return;
                }
                let action = match work {
                    KeyWork::Generated => Some(AuditAction::KeyGenerate),
                    KeyWork::Rewrapped => Some(AuditAction::KeyRotate),
                    KeyWork::AlreadyCurrent | KeyWork::Skipped => None,
                };
                if let Some(action) = action {
                    self.emit(
                        AuditRecord::success(action, job.license_id, self.clock.now())
                            .with_user(job.user_id)
                            .with_device(job.device_id),
                    );
                }
            }
            Err(e) => {
                tracing::error!(%job_id, retry_count = job.retry_count, "❌ Encryption job failed: {}", e);
                self.emit(
                    AuditRecord::failure(AuditAction::MaterialEncrypt, job.license_id, e.code(), self.clock.now())
                        .with_user(job.user_id)
                        .with_device(job.device_id),
                );
                self.fail_and_maybe_retry(&job, &e).await;
            }
        }
    }

    async fn fail_and_maybe_retry(&self, job: &EncryptionJob, error: &AppError) {
        if let Err(e) = self.queue.mark_failed(job.id, &error.to_string()).await {
            tracing::warn!(job_id = %job.id, "Could not mark job failed: {}", e);
            return;
        }
        if job.retry_count >= self.config.max_retries {
            tracing::warn!(job_id = %job.id, retry_count = job.retry_count, "Job out of retries, abandoned");
            return;
        }
        if let Err(e) = self.queue.retry(job.id).await {
            tracing::warn!(job_id = %job.id, "Could not requeue job: {}", e);
        }
    }

    async fn produce_key(&self, job: &EncryptionJob) -> Result<KeyWork> {
        if let Some(license_id) = job.license_id {
            if !self.license_is_active(license_id).await? {
                tracing::info!(job_id = %job.id, %license_id, "License no longer active, skipping job");
                return Ok(KeyWork::Skipped);
            }
        }

        let binding = DeviceBinding::new(job.user_id, job.material_id, job.device_id);
        let version = self.wrapper.current_version();

        match self.keys.find_by_composite(job.user_id, job.material_id, job.device_id).await? {
            Some(cek) if cek.key_version >= version => Ok(KeyWork::AlreadyCurrent),
            Some(cek) => {
                let rewrapped = self
                    .wrapper
                    .rewrap(&cek.encrypted_key, binding, cek.key_version, version)
                    .await?;
                match self.keys.rotate(cek.id, &rewrapped, version).await {
                    Ok(()) => Ok(KeyWork::Rewrapped),
                    // A concurrent rotation got there first.
                    Err(AppError::InvalidTransition(_)) => Ok(KeyWork::AlreadyCurrent),
                    Err(e) => Err(e),
                }
            }
            None => {
                let raw = aes::generate_key();
                let wrapped = self.wrapper.wrap(raw.as_bytes(), binding).await?;
                match self.keys.put_at_version(binding, wrapped, version).await {
                    Ok(_) => Ok(KeyWork::Generated),
                    // Another job for the same binding stored its key first.
                    Err(AppError::Conflict(_)) => Ok(KeyWork::AlreadyCurrent),
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn license_is_active(&self, license_id: Uuid) -> Result<bool> {
        match self.ledger.get(license_id).await {
            Ok(license) => Ok(license.is_active()),
            Err(AppError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn emit(&self, record: AuditRecord) {
        if let Some(audit) = &self.audit {
            audit.try_enqueue(record);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SweeperConfig {
    pub visibility_timeout: chrono::Duration,
    pub max_retries: i32,
    /// Completed jobs older than this are deleted.
    pub retention: chrono::Duration,
    pub interval: Duration,
}

impl TryFrom<&Config> for SweeperConfig {
    type Error = anyhow::Error;

    fn try_from(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            visibility_timeout: chrono::Duration::from_std(config.job_visibility_timeout)?,
            max_retries: config.job_max_retries,
            retention: chrono::Duration::from_std(config.job_retention)?,
            interval: config.sweep_interval,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stale: StaleSweep,
    pub reaped: u64,
}

/// Periodic queue housekeeping: reclaims jobs stuck in `processing` and
/// deletes old completed jobs.
#[derive(Clone)]
pub struct Sweeper {
    queue: JobQueue,
    clock: Arc<dyn Clock>,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(queue: JobQueue, clock: Arc<dyn Clock>, config: SweeperConfig) -> Self {
        Self { queue, clock, config }
    }

    pub async fn run_once(&self) -> Result<SweepReport> {
        let stale = self
            .queue
            .requeue_stale(self.config.visibility_timeout, self.config.max_retries)
            .await?;
        let reaped = self.queue.reap(self.clock.now() - self.config.retention).await?;
        Ok(SweepReport { stale, reaped })
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval_secs = self.config.interval.as_secs(), "🧹 Job sweeper started");
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::error!("❌ Job sweep failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Job sweeper stopped");
    }
}
