use std::sync::Arc;
use uuid::Uuid;

use crate::{
    clock::Clock,
    crypto::kek::KeyWrapper,
    error::{AppError, Result},
    models::cek::{ContentEncryptionKey, DeviceBinding},
    repositories::cek::CekRepository,
};

/// Outcome of a bulk re-wrap sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotationReport {
    pub rotated: usize,
    /// Already moved by a concurrent rotation.
    pub skipped: usize,
    pub failed: usize,
}

/// Storage of wrapped CEKs, one per (user, material, device).
#[derive(Clone)]
pub struct KeyStore {
    repo: Arc<dyn CekRepository>,
    clock: Arc<dyn Clock>,
}

impl KeyStore {
    pub fn new(repo: Arc<dyn CekRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    /// Stores a new wrapped key at version 1. Fails `Conflict` if the
    /// binding already has one; use [`KeyStore::rotate`] instead.
    pub async fn put(&self, binding: DeviceBinding, wrapped_key: Vec<u8>) -> Result<ContentEncryptionKey> {
        self.put_at_version(binding, wrapped_key, 1).await
    }

    /// Like [`KeyStore::put`], for a key wrapped under a KEK newer than 1.
    pub async fn put_at_version(
        &self,
        binding: DeviceBinding,
        wrapped_key: Vec<u8>,
        key_version: i32,
    ) -> Result<ContentEncryptionKey> {
        if key_version < 1 {
            return Err(AppError::Validation(format!("invalid key version {}", key_version)));
        }
        let cek = ContentEncryptionKey {
            key_version,
            ..ContentEncryptionKey::new(binding, wrapped_key, self.clock.now())
        };
        self.repo.insert(&cek).await?;
        tracing::info!(
            cek_id = %cek.id,
            user_id = %binding.user_id,
            material_id = %binding.material_id,
            device_id = %binding.device_id,
            key_version,
            "CEK stored"
        );
        Ok(cek)
    }

    pub async fn find(&self, cek_id: Uuid) -> Result<Option<ContentEncryptionKey>> {
        self.repo.find_by_id(cek_id).await
    }

    pub async fn find_by_composite(
        &self,
        user_id: Uuid,
        material_id: Uuid,
        device_id: Uuid,
    ) -> Result<Option<ContentEncryptionKey>> {
        self.repo
            .find_by_binding(DeviceBinding::new(user_id, material_id, device_id))
            .await
    }

    pub async fn get(&self, cek_id: Uuid) -> Result<ContentEncryptionKey> {
        self.find(cek_id).await?.ok_or(AppError::NotFound)
    }

    /// Replaces the wrapped key in place. `new_version` must be above the
    /// current version; otherwise `InvalidTransition`.
    pub async fn rotate(&self, cek_id: Uuid, new_wrapped_key: &[u8], new_version: i32) -> Result<()> {
        if self.repo.update_key(cek_id, new_wrapped_key, new_version).await? {
            tracing::info!(%cek_id, key_version = new_version, "CEK rotated");
            return Ok(());
        }
        match self.repo.find_by_id(cek_id).await? {
            None => Err(AppError::NotFound),
            Some(current) => Err(AppError::InvalidTransition(format!(
                "key version {} is not above current version {}",
                new_version, current.key_version
            ))),
        }
    }

    pub async fn list_by_key_version(&self, key_version: i32) -> Result<Vec<ContentEncryptionKey>> {
        self.repo.list_by_key_version(key_version).await
    }

    pub async fn delete_by_device(&self, device_id: Uuid) -> Result<u64> {
        let count = self.repo.delete_by_device(device_id).await?;
        tracing::info!(%device_id, count, "Deleted CEKs for device");
        Ok(count)
    }

    pub async fn delete_by_material(&self, material_id: Uuid) -> Result<u64> {
        let count = self.repo.delete_by_material(material_id).await?;
        tracing::info!(%material_id, count, "Deleted CEKs for material");
        Ok(count)
    }

    /// Re-wraps every CEK still under `from_version` to the wrapper's current
    /// version. A CEK that fails is logged and counted; the sweep continues.
    pub async fn rotate_all(&self, from_version: i32, wrapper: &dyn KeyWrapper) -> Result<RotationReport> {
        let to_version = wrapper.current_version();
        if to_version <= from_version {
            return Err(AppError::InvalidTransition(format!(
                "current KEK version {} is not above {}",
                to_version, from_version
            )));
        }

        let ceks = self.repo.list_by_key_version(from_version).await?;
        tracing::info!(from_version, to_version, count = ceks.len(), "🔑 Starting CEK rotation sweep");

        let mut report = RotationReport::default();
        for cek in ceks {
            let rewrapped = match wrapper
                .rewrap(&cek.encrypted_key, cek.binding(), from_version, to_version)
                .await
            {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(cek_id = %cek.id, "Failed to rewrap CEK: {}", e);
                    report.failed += 1;
                    continue;
                }
            };

            match self.rotate(cek.id, &rewrapped, to_version).await {
                Ok(()) => report.rotated += 1,
                Err(AppError::NotFound) | Err(AppError::InvalidTransition(_)) => {
                    tracing::debug!(cek_id = %cek.id, "CEK deleted or rotated concurrently");
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::error!(cek_id = %cek.id, "Failed to store rotated CEK: {}", e);
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            rotated = report.rotated,
            skipped = report.skipped,
            failed = report.failed,
            "✅ CEK rotation sweep finished"
        );
        Ok(report)
    }
}
