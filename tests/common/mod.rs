#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use uuid::Uuid;
use zeroize::Zeroizing;

use offline_access::clock::{Clock, ManualClock};
use offline_access::crypto::kek::{AesKeyWrapper, KeyWrapper};
use offline_access::repositories::memory::MemoryStore;
use offline_access::services::{
    audit::{AuditForwarder, MemoryAuditSink},
    job_queue::JobQueue,
    key_store::KeyStore,
    ledger::{LedgerConfig, LicenseLedger},
    orchestrator::Orchestrator,
    worker::{EncryptionWorker, Sweeper, SweeperConfig, WorkerConfig},
};

pub const MASTER_KEY: [u8; 32] = [0x42; 32];

// Shared test context: every component over one in-memory store and one clock.
pub struct TestContext {
    pub store: MemoryStore,
    pub clock: ManualClock,
    pub ledger: LicenseLedger,
    pub keys: KeyStore,
    pub queue: JobQueue,
    pub audit: AuditForwarder,
    pub audit_sink: MemoryAuditSink,
    pub orchestrator: Orchestrator,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_ledger_config(LedgerConfig::default())
    }

    pub fn with_ledger_config(ledger_config: LedgerConfig) -> Self {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Self::start());
        let shared_clock = Arc::new(clock.clone());

        let ledger = LicenseLedger::new(Arc::new(store.clone()), shared_clock.clone(), ledger_config);
        let keys = KeyStore::new(Arc::new(store.clone()), shared_clock.clone());
        let queue = JobQueue::new(Arc::new(store.clone()), shared_clock.clone());

        let audit_sink = MemoryAuditSink::new();
        let audit = AuditForwarder::new(vec![Arc::new(audit_sink.clone())], 64);

        let orchestrator = Orchestrator::new(
            ledger.clone(),
            keys.clone(),
            queue.clone(),
            shared_clock,
            Some(audit.clone()),
        );

        Self { store, clock, ledger, keys, queue, audit, audit_sink, orchestrator }
    }

    /// 2026-01-01T00:00:00Z, the instant every context starts at.
    pub fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn wrapper(version: i32) -> Arc<AesKeyWrapper> {
        Arc::new(AesKeyWrapper::new(Zeroizing::new(MASTER_KEY.to_vec()), version).unwrap())
    }

    pub fn worker(&self, wrapper: Arc<dyn KeyWrapper>, config: WorkerConfig) -> EncryptionWorker {
        EncryptionWorker::new(
            self.queue.clone(),
            self.ledger.clone(),
            self.keys.clone(),
            wrapper,
            Arc::new(self.clock.clone()),
            Some(self.audit.clone()),
            config,
        )
    }

    pub fn sweeper(&self, config: SweeperConfig) -> Sweeper {
        Sweeper::new(self.queue.clone(), Arc::new(self.clock.clone()), config)
    }
}

/// A fresh (user, material, device) triple.
pub fn triple() -> (Uuid, Uuid, Uuid) {
    (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4())
}
