use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::aes::{self, KEY_SIZE};
use crate::error::{AppError, Result};
use crate::models::cek::DeviceBinding;

/// Domain separator mixed into every KEK derivation.
const KEK_CONTEXT: &[u8] = b"offline-access/kek";

/// A cached Key Encryption Key (KEK).
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct CachedKek {
    keydata: [u8; KEY_SIZE],
}

/// A cache for derived KEKs, keyed by version.
#[derive(Clone, Default)]
pub struct KekCache {
    cache: Arc<RwLock<HashMap<i32, CachedKek>>>,
}

impl KekCache {
    /// Creates a new `KekCache`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets a KEK from the cache by version.
    pub async fn get(&self, version: i32) -> Option<Zeroizing<[u8; KEY_SIZE]>> {
        let cache = self.cache.read().await;
        cache.get(&version).map(|kek| Zeroizing::new(kek.keydata))
    }

    /// Inserts a KEK into the cache.
    pub async fn insert(&self, version: i32, keydata: &[u8; KEY_SIZE]) {
        let mut cache = self.cache.write().await;
        cache.insert(version, CachedKek { keydata: *keydata });
    }

    /// Number of cached versions.
    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }
}

/// Wraps and unwraps raw CEKs under versioned KEKs. The binding is
/// authenticated with every wrap, so a wrapped key only opens for the
/// (user, material, device) it was produced for.
#[async_trait]
pub trait KeyWrapper: Send + Sync {
    /// Version new keys are wrapped under.
    fn current_version(&self) -> i32;

    async fn wrap_at(&self, raw_key: &[u8], binding: DeviceBinding, version: i32) -> Result<Vec<u8>>;

    async fn unwrap(
        &self,
        wrapped: &[u8],
        binding: DeviceBinding,
        version: i32,
    ) -> Result<Zeroizing<Vec<u8>>>;

    /// Wraps under the current version.
    async fn wrap(&self, raw_key: &[u8], binding: DeviceBinding) -> Result<Vec<u8>> {
        self.wrap_at(raw_key, binding, self.current_version()).await
    }

    /// Re-wraps a key from one KEK version to another without exposing it.
    async fn rewrap(
        &self,
        wrapped: &[u8],
        binding: DeviceBinding,
        from_version: i32,
        to_version: i32,
    ) -> Result<Vec<u8>> {
        let raw = self.unwrap(wrapped, binding, from_version).await?;
        self.wrap_at(&raw, binding, to_version).await
    }
}

/// AES-256-GCM key wrapper with KEKs derived from the master key.
///
/// `KEK_v = SHA-256(context || master_key || v)`. Derived keys live in a
/// [`KekCache`] so each version is derived once per process.
#[derive(Clone)]
pub struct AesKeyWrapper {
    master_key: Arc<Zeroizing<Vec<u8>>>,
    current_version: i32,
    cache: KekCache,
}

impl AesKeyWrapper {
    /// # Arguments
    ///
    /// * `master_key` - 32 bytes of master key material.
    /// * `current_version` - KEK version new keys are wrapped under, at least 1.
    pub fn new(master_key: Zeroizing<Vec<u8>>, current_version: i32) -> Result<Self> {
        if master_key.len() != KEY_SIZE {
            return Err(AppError::Encryption("Invalid master key size".to_string()));
        }
        check_version(current_version)?;
        Ok(Self {
            master_key: Arc::new(master_key),
            current_version,
            cache: KekCache::new(),
        })
    }

    pub fn cache(&self) -> &KekCache {
        &self.cache
    }

    async fn kek(&self, version: i32) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        check_version(version)?;
        if let Some(kek) = self.cache.get(version).await {
            tracing::trace!(version, "KEK retrieved from cache");
            return Ok(kek);
        }

        let mut hasher = Sha256::new();
        hasher.update(KEK_CONTEXT);
        hasher.update(self.master_key.as_slice());
        hasher.update(version.to_be_bytes());
        let mut digest = hasher.finalize();
        let mut kek = Zeroizing::new([0u8; KEY_SIZE]);
        kek.copy_from_slice(&digest);
        digest.as_mut_slice().zeroize();

        self.cache.insert(version, &kek).await;
        let cached = self.cache.len().await;
        tracing::debug!(version, cached, "KEK derived and cached");
        Ok(kek)
    }
}

fn check_version(version: i32) -> Result<()> {
    if version < 1 {
        return Err(AppError::Validation(format!("invalid KEK version {}", version)));
    }
    Ok(())
}

#[async_trait]
impl KeyWrapper for AesKeyWrapper {
    fn current_version(&self) -> i32 {
        self.current_version
    }

    async fn wrap_at(&self, raw_key: &[u8], binding: DeviceBinding, version: i32) -> Result<Vec<u8>> {
        let kek = self.kek(version).await?;
        aes::seal(&kek, raw_key, &binding.associated_data())
    }

    async fn unwrap(
        &self,
        wrapped: &[u8],
        binding: DeviceBinding,
        version: i32,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let kek = self.kek(version).await?;
        aes::open(&kek, wrapped, &binding.associated_data()).map(Zeroizing::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn wrapper(version: i32) -> AesKeyWrapper {
        AesKeyWrapper::new(Zeroizing::new(vec![7u8; KEY_SIZE]), version).unwrap()
    }

    fn binding() -> DeviceBinding {
        DeviceBinding::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4())
    }

    #[tokio::test]
    async fn wrapped_key_opens_only_for_its_binding_and_version() {
        let w = wrapper(1);
        let b = binding();
        let raw = aes::generate_key();
        let wrapped = w.wrap(raw.as_bytes(), b).await.unwrap();

        assert_eq!(w.unwrap(&wrapped, b, 1).await.unwrap().as_slice(), raw.as_bytes());
        assert!(w.unwrap(&wrapped, binding(), 1).await.is_err());
        assert!(w.unwrap(&wrapped, b, 2).await.is_err());
    }

    #[tokio::test]
    async fn rewrap_moves_key_between_versions() {
        let w = wrapper(2);
        let b = binding();
        let raw = aes::generate_key();
        let v1 = w.wrap_at(raw.as_bytes(), b, 1).await.unwrap();

        let v2 = w.rewrap(&v1, b, 1, 2).await.unwrap();
        assert_eq!(w.unwrap(&v2, b, 2).await.unwrap().as_slice(), raw.as_bytes());
        assert_eq!(w.cache().len().await, 2);
    }

    #[tokio::test]
    async fn rejects_bad_versions_and_keys() {
        assert!(AesKeyWrapper::new(Zeroizing::new(vec![0u8; 16]), 1).is_err());
        assert!(AesKeyWrapper::new(Zeroizing::new(vec![0u8; KEY_SIZE]), 0).is_err());
        let w = wrapper(1);
        assert!(w.wrap_at(b"k", binding(), 0).await.is_err());
    }
}
