use anyhow::Context;
use deadpool_postgres::Pool;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::crypto::kek::{AesKeyWrapper, KeyWrapper};
use crate::repositories::{
    cek::PgCekRepository, job::PgJobRepository, license::PgLicenseRepository,
};
use crate::services::{
    audit::{AuditForwarder, AuditSink, TracingAuditSink},
    job_queue::JobQueue,
    key_store::KeyStore,
    ledger::{LedgerConfig, LicenseLedger},
    orchestrator::Orchestrator,
    worker::{EncryptionWorker, Sweeper, SweeperConfig, WorkerConfig},
};

/// Everything the service runs, wired over Postgres.
#[derive(Clone)]
pub struct AppState {
    /// The database connection pool.
    pub db: Pool,
    /// The service configuration.
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub wrapper: Arc<dyn KeyWrapper>,
    pub audit: AuditForwarder,
    pub orchestrator: Orchestrator,
    pub worker: EncryptionWorker,
    pub sweeper: Sweeper,
}

impl AppState {
    /// Creates the pool, applies the schema and builds the engine.
    ///
    /// Must be called inside a Tokio runtime (the audit forwarder spawns its task).
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let db = crate::db::create_pool(&config.database_url, config.database_pool_size)?;
        tracing::info!(max_size = config.database_pool_size, "✅ PostgreSQL pool initialized");

        crate::db::run_migrations(&db).await?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let wrapper: Arc<dyn KeyWrapper> = Arc::new(
            AesKeyWrapper::new(config.master_key.clone(), config.kek_version)
                .context("Invalid master key")?,
        );
        tracing::info!(kek_version = config.kek_version, "✅ Key wrapper initialized");

        let sinks: Vec<Arc<dyn AuditSink>> = vec![Arc::new(TracingAuditSink)];
        let audit = AuditForwarder::new(sinks, config.audit_queue_size);

        let ledger = LicenseLedger::new(
            Arc::new(PgLicenseRepository::new(db.clone(), config.lenient_grace_parsing)),
            clock.clone(),
            LedgerConfig::from(config),
        );
        let keys = KeyStore::new(Arc::new(PgCekRepository::new(db.clone())), clock.clone());
        let queue = JobQueue::new(Arc::new(PgJobRepository::new(db.clone())), clock.clone());

        let orchestrator = Orchestrator::new(
            ledger.clone(),
            keys.clone(),
            queue.clone(),
            clock.clone(),
            Some(audit.clone()),
        );
        let worker = EncryptionWorker::new(
            queue.clone(),
            ledger,
            keys,
            wrapper.clone(),
            clock.clone(),
            Some(audit.clone()),
            WorkerConfig::from(config),
        );
        let sweeper = Sweeper::new(queue, clock.clone(), SweeperConfig::try_from(config)?);

        Ok(AppState {
            db,
            config: config.clone(),
            clock,
            wrapper,
            audit,
            orchestrator,
            worker,
            sweeper,
        })
    }
}
