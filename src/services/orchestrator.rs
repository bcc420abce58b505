use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    clock::Clock,
    error::Result,
    models::{
        audit::{AuditAction, AuditRecord},
        cek::ContentEncryptionKey,
        job::EncryptionJob,
        license::License,
    },
    services::{
        audit::AuditForwarder,
        job_queue::JobQueue,
        key_store::KeyStore,
        ledger::{LicenseLedger, Validated},
    },
};

/// A newly issued license and the job that will produce its key.
#[derive(Debug, Clone)]
pub struct OfflineGrant {
    pub license: License,
    pub job: EncryptionJob,
}

/// Result of a successful validation.
#[derive(Debug, Clone)]
pub enum ValidationOutcome {
    /// The license is valid and its wrapped key is available.
    Ready {
        license: License,
        cek: ContentEncryptionKey,
        next_nonce: String,
    },
    /// The license is valid but the key has not been produced yet; poll again.
    KeyPending { license: License, next_nonce: String },
}

impl ValidationOutcome {
    pub fn next_nonce(&self) -> &str {
        match self {
            ValidationOutcome::Ready { next_nonce, .. } => next_nonce,
            ValidationOutcome::KeyPending { next_nonce, .. } => next_nonce,
        }
    }

    pub fn license(&self) -> &License {
        match self {
            ValidationOutcome::Ready { license, .. } => license,
            ValidationOutcome::KeyPending { license, .. } => license,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeReport {
    pub licenses_revoked: u64,
    pub keys_deleted: u64,
}

/// Coordinates the ledger, the key store and the job queue, and audits
/// every issuance, validation, renewal and revocation outcome.
#[derive(Clone)]
pub struct Orchestrator {
    ledger: LicenseLedger,
    keys: KeyStore,
    queue: JobQueue,
    clock: Arc<dyn Clock>,
    audit: Option<AuditForwarder>,
}

impl Orchestrator {
    pub fn new(
        ledger: LicenseLedger,
        keys: KeyStore,
        queue: JobQueue,
        clock: Arc<dyn Clock>,
        audit: Option<AuditForwarder>,
    ) -> Self {
        Self { ledger, keys, queue, clock, audit }
    }

    pub fn ledger(&self) -> &LicenseLedger {
        &self.ledger
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    fn emit(&self, record: AuditRecord) {
        if let Some(audit) = &self.audit {
            audit.try_enqueue(record);
        }
    }

    fn outcome<T>(&self, action: AuditAction, resource: Option<Uuid>, result: &Result<T>) -> AuditRecord {
        let now = self.clock.now();
        match result {
            Ok(_) => AuditRecord::success(action, resource, now),
            Err(e) => AuditRecord::failure(action, resource, e.code(), now),
        }
    }

    /// Issues a license and enqueues the job producing its CEK.
    ///
    /// If the job cannot be enqueued the license is revoked again, so the
    /// caller can retry the whole request.
    pub async fn request_offline_access(
        &self,
        user_id: Uuid,
        material_id: Uuid,
        device_id: Uuid,
        grace_period: Option<Duration>,
        priority: i32,
    ) -> Result<OfflineGrant> {
        let issued = self.ledger.issue(user_id, material_id, device_id, grace_period).await;
        let resource = issued.as_ref().ok().map(|l| l.id);
        self.emit(
            self.outcome(AuditAction::LicenseIssue, resource, &issued)
                .with_user(user_id)
                .with_device(device_id),
        );
        let license = issued?;

        match self
            .queue
            .enqueue(material_id, user_id, device_id, Some(license.id), priority)
            .await
        {
            Ok(job) => Ok(OfflineGrant { license, job }),
            Err(e) => {
                tracing::error!(license_id = %license.id, "Failed to enqueue encryption job: {}", e);
                if let Err(undo) = self.revoke(license.id).await {
                    tracing::error!(license_id = %license.id, "Failed to revoke orphaned license: {}", undo);
                }
                Err(e)
            }
        }
    }

    /// Validates a license and looks up its key.
    ///
    /// Denials keep their precise error here; flattening them to a single
    /// "access denied" happens at the response boundary.
    pub async fn validate(&self, license_id: Uuid, presented_nonce: &str) -> Result<ValidationOutcome> {
        let result = self.validate_and_lookup(license_id, presented_nonce).await;
        let mut record = self.outcome(AuditAction::LicenseValidate, Some(license_id), &result);
        if let Ok(outcome) = &result {
            let license = outcome.license();
            record = record.with_user(license.user_id).with_device(license.device_id);
        }
        self.emit(record);
        result
    }

    async fn validate_and_lookup(&self, license_id: Uuid, presented_nonce: &str) -> Result<ValidationOutcome> {
        let license = self.ledger.check(license_id, presented_nonce).await?;

        // Before the nonce is consumed: a failed lookup must leave the
        // device's current nonce usable.
        let cek = self
            .keys
            .find_by_composite(license.user_id, license.material_id, license.device_id)
            .await?;

        let Validated { license, next_nonce } = self.ledger.consume(license).await?;

        Ok(match cek {
            Some(cek) => ValidationOutcome::Ready { license, cek, next_nonce },
            None => {
                tracing::debug!(%license_id, "License valid, key not ready");
                ValidationOutcome::KeyPending { license, next_nonce }
            }
        })
    }

    pub async fn renew(&self, license_id: Uuid, new_expiry: DateTime<Utc>) -> Result<License> {
        let renewed = self.ledger.renew(license_id, new_expiry).await;
        self.emit(self.outcome(AuditAction::LicenseRenew, Some(license_id), &renewed));
        renewed
    }

    pub async fn revoke(&self, license_id: Uuid) -> Result<bool> {
        let revoked = self.ledger.revoke(license_id).await;
        self.emit(self.outcome(AuditAction::LicenseRevoke, Some(license_id), &revoked));
        revoked
    }

    /// Revokes every license on the device, then deletes its keys. Jobs still
    /// outstanding for the device are left to finish; the worker skips jobs
    /// whose license is no longer active.
    pub async fn deregister_device(&self, device_id: Uuid) -> Result<CascadeReport> {
        let result = self.cascade_device(device_id).await;
        self.emit(
            self.outcome(AuditAction::DeviceDeregister, Some(device_id), &result)
                .with_device(device_id),
        );
        result
    }

    async fn cascade_device(&self, device_id: Uuid) -> Result<CascadeReport> {
        let licenses_revoked = self.ledger.revoke_all_for_device(device_id).await?;
        let keys_deleted = self.keys.delete_by_device(device_id).await?;
        Ok(CascadeReport { licenses_revoked, keys_deleted })
    }

    /// Revokes every license for the material, then deletes its keys.
    pub async fn withdraw_material(&self, material_id: Uuid) -> Result<CascadeReport> {
        let result = self.cascade_material(material_id).await;
        self.emit(self.outcome(AuditAction::MaterialWithdraw, Some(material_id), &result));
        result
    }

    async fn cascade_material(&self, material_id: Uuid) -> Result<CascadeReport> {
        let licenses_revoked = self.ledger.revoke_all_for_material(material_id).await?;
        let keys_deleted = self.keys.delete_by_material(material_id).await?;
        Ok(CascadeReport { licenses_revoked, keys_deleted })
    }

    /// Revokes one user's licenses for a material. Keys are kept; they no
    /// longer validate without an active license.
    pub async fn revoke_user_material(&self, user_id: Uuid, material_id: Uuid) -> Result<CascadeReport> {
        let result = self
            .ledger
            .revoke_all_for_user_and_material(user_id, material_id)
            .await
            .map(|licenses_revoked| CascadeReport { licenses_revoked, keys_deleted: 0 });
        self.emit(
            self.outcome(AuditAction::LicenseRevoke, Some(material_id), &result)
                .with_user(user_id),
        );
        result
    }
}
