use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    clock::Clock,
    config::Config,
    crypto::nonce,
    error::{AppError, Result},
    models::cek::DeviceBinding,
    models::license::{grace_deadline, License, DEFAULT_LICENSE_VALIDITY_DAYS, DEFAULT_OFFLINE_GRACE_HOURS},
    repositories::license::LicenseRepository,
};

/// Issuance defaults.
#[derive(Debug, Clone, Copy)]
pub struct LedgerConfig {
    /// `expires_at = now + default_validity` for new licenses.
    pub default_validity: Duration,
    /// Grace period used when `issue` is not given one.
    pub default_grace: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            default_validity: Duration::days(DEFAULT_LICENSE_VALIDITY_DAYS),
            default_grace: Duration::hours(DEFAULT_OFFLINE_GRACE_HOURS),
        }
    }
}

impl From<&Config> for LedgerConfig {
    fn from(config: &Config) -> Self {
        Self {
            default_validity: config.license_validity(),
            default_grace: config.offline_grace_period(),
        }
    }
}

/// A successful validation: the license as it now stands and the nonce the
/// device must present next time.
#[derive(Debug, Clone)]
pub struct Validated {
    pub license: License,
    pub next_nonce: String,
}

/// Issuance, validation, renewal and revocation of licenses.
#[derive(Clone)]
pub struct LicenseLedger {
    repo: Arc<dyn LicenseRepository>,
    clock: Arc<dyn Clock>,
    config: LedgerConfig,
}

impl LicenseLedger {
    pub fn new(repo: Arc<dyn LicenseRepository>, clock: Arc<dyn Clock>, config: LedgerConfig) -> Self {
        Self { repo, clock, config }
    }

    /// Issues a new active license for the binding.
    ///
    /// # Arguments
    ///
    /// * `grace_period` - Offline grace period; `None` uses the configured default.
    ///
    /// # Returns
    ///
    /// The new license. Fails `Conflict` if an active license already exists
    /// for the same (user, material, device).
    pub async fn issue(
        &self,
        user_id: Uuid,
        material_id: Uuid,
        device_id: Uuid,
        grace_period: Option<Duration>,
    ) -> Result<License> {
        let grace = grace_period.unwrap_or(self.config.default_grace);
        if grace < Duration::zero() {
            return Err(AppError::Validation("grace period must not be negative".to_string()));
        }
        let now = self.clock.now();
        let deadline = now
            .checked_add_signed(self.config.default_validity)
            .and_then(|expires_at| grace_deadline(expires_at, grace));
        if deadline.is_none() {
            return Err(AppError::Validation("grace period is out of range".to_string()));
        }

        let binding = DeviceBinding::new(user_id, material_id, device_id);
        if self.repo.find_active_by_binding(binding).await?.is_some() {
            return Err(AppError::Conflict(
                "active license already exists for this binding".to_string(),
            ));
        }

        let license = License::new(
            user_id,
            material_id,
            device_id,
            self.config.default_validity,
            grace,
            nonce::generate(),
            now,
        );
        // The store enforces uniqueness too; a racing issuer surfaces as Conflict here.
        self.repo.insert(&license).await?;

        tracing::info!(
            license_id = %license.id,
            %user_id,
            %material_id,
            %device_id,
            expires_at = %license.expires_at,
            "License issued"
        );
        Ok(license)
    }

    /// Validates a license against the nonce the device presents and rotates it.
    ///
    /// Checks run in order: existence, revocation, expiry, nonce. Any nonce
    /// other than the current one fails `StaleNonce` and leaves the stored
    /// nonce untouched. Of two racing validations with the same nonce, exactly
    /// one succeeds.
    pub async fn validate(&self, license_id: Uuid, presented_nonce: &str) -> Result<Validated> {
        let license = self.check(license_id, presented_nonce).await?;
        self.consume(license).await
    }

    /// Runs every check `validate` runs without touching the stored nonce.
    pub async fn check(&self, license_id: Uuid, presented_nonce: &str) -> Result<License> {
        let license = self.get(license_id).await?;
        Self::check_usable(&license, self.clock.now())?;

        if !nonce::matches(presented_nonce, &license.nonce) {
            tracing::warn!(%license_id, "Stale nonce presented");
            return Err(AppError::StaleNonce);
        }
        Ok(license)
    }

    /// Rotates the nonce of a license returned by `check`. Fails if another
    /// validation or a revocation got there first.
    pub async fn consume(&self, license: License) -> Result<Validated> {
        let license_id = license.id;
        let now = self.clock.now();
        let next_nonce = nonce::generate();
        if !self
            .repo
            .rotate_nonce(license_id, &license.nonce, &next_nonce, now)
            .await?
        {
            // Lost a race: find out against what.
            return Err(match self.repo.find_by_id(license_id).await? {
                None => AppError::NotFound,
                Some(current) if !current.is_active() => AppError::Revoked,
                Some(_) => AppError::StaleNonce,
            });
        }

        tracing::debug!(%license_id, "License validated, nonce rotated");
        let license = License {
            nonce: next_nonce.clone(),
            last_validated_at: Some(now),
            ..license
        };
        Ok(Validated { license, next_nonce })
    }

    fn check_usable(license: &License, now: DateTime<Utc>) -> Result<()> {
        if !license.is_active() {
            return Err(AppError::Revoked);
        }
        if license.is_expired_at(now) {
            return Err(AppError::Expired);
        }
        Ok(())
    }

    /// Moves `expires_at` forward. Fails `InvalidTransition` unless
    /// `new_expiry` is strictly later than the current expiry.
    pub async fn renew(&self, license_id: Uuid, new_expiry: DateTime<Utc>) -> Result<License> {
        let license = self.get(license_id).await?;
        if !license.is_active() {
            return Err(AppError::Revoked);
        }
        if new_expiry <= license.expires_at {
            return Err(AppError::InvalidTransition(format!(
                "new expiry {} is not after current expiry {}",
                new_expiry, license.expires_at
            )));
        }

        if !self.repo.extend_expiry(license_id, new_expiry).await? {
            return Err(match self.repo.find_by_id(license_id).await? {
                None => AppError::NotFound,
                Some(current) if !current.is_active() => AppError::Revoked,
                Some(current) => AppError::InvalidTransition(format!(
                    "expiry already moved to {}",
                    current.expires_at
                )),
            });
        }

        tracing::info!(%license_id, expires_at = %new_expiry, "License renewed");
        Ok(License { expires_at: new_expiry, ..license })
    }

    /// Revokes a license.
    ///
    /// # Returns
    ///
    /// `true` if this call revoked it, `false` if it was already revoked.
    pub async fn revoke(&self, license_id: Uuid) -> Result<bool> {
        if self.repo.revoke(license_id, self.clock.now()).await? {
            tracing::info!(%license_id, "License revoked");
            return Ok(true);
        }
        match self.repo.find_by_id(license_id).await? {
            None => Err(AppError::NotFound),
            Some(_) => {
                tracing::debug!(%license_id, "License already revoked");
                Ok(false)
            }
        }
    }

    /// Revokes every active license on a device. Returns how many changed.
    pub async fn revoke_all_for_device(&self, device_id: Uuid) -> Result<u64> {
        let count = self.repo.revoke_by_device(device_id, self.clock.now()).await?;
        tracing::info!(%device_id, count, "Revoked licenses for device");
        Ok(count)
    }

    pub async fn revoke_all_for_material(&self, material_id: Uuid) -> Result<u64> {
        let count = self.repo.revoke_by_material(material_id, self.clock.now()).await?;
        tracing::info!(%material_id, count, "Revoked licenses for material");
        Ok(count)
    }

    pub async fn revoke_all_for_user_and_material(
        &self,
        user_id: Uuid,
        material_id: Uuid,
    ) -> Result<u64> {
        let count = self
            .repo
            .revoke_by_user_and_material(user_id, material_id, self.clock.now())
            .await?;
        tracing::info!(%user_id, %material_id, count, "Revoked licenses for user and material");
        Ok(count)
    }

    /// Fetches a license by id, failing `NotFound` when absent.
    pub async fn get(&self, license_id: Uuid) -> Result<License> {
        self.repo.find_by_id(license_id).await?.ok_or(AppError::NotFound)
    }

    pub async fn list_active_for_device(&self, device_id: Uuid) -> Result<Vec<License>> {
        self.repo.list_active_by_device(device_id).await
    }

    pub async fn list_active_for_user(&self, user_id: Uuid) -> Result<Vec<License>> {
        self.repo.list_active_by_user(user_id).await
    }
}
