use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

/// The (user, material, device) triple a license and its CEK are bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceBinding {
    pub user_id: Uuid,
    pub material_id: Uuid,
    pub device_id: Uuid,
}

impl DeviceBinding {
    pub fn new(user_id: Uuid, material_id: Uuid, device_id: Uuid) -> Self {
        Self { user_id, material_id, device_id }
    }

    /// Associated data for key wrapping: the three ids, 48 bytes.
    pub fn associated_data(&self) -> [u8; 48] {
        let mut aad = [0u8; 48];
        aad[..16].copy_from_slice(self.user_id.as_bytes());
        aad[16..32].copy_from_slice(self.material_id.as_bytes());
        aad[32..].copy_from_slice(self.device_id.as_bytes());
        aad
    }
}

/// A wrapped content encryption key.
#[derive(Clone, PartialEq)]
pub struct ContentEncryptionKey {
    pub id: Uuid,
    pub user_id: Uuid,
    pub material_id: Uuid,
    pub device_id: Uuid,
    /// Wrapped key bytes. Never logged.
    pub encrypted_key: Vec<u8>,
    /// Version of the KEK the key is wrapped under, starting at 1.
    pub key_version: i32,
    pub created_at: DateTime<Utc>,
}

impl ContentEncryptionKey {
    pub fn new(binding: DeviceBinding, encrypted_key: Vec<u8>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: binding.user_id,
            material_id: binding.material_id,
            device_id: binding.device_id,
            encrypted_key,
            key_version: 1,
            created_at: now,
        }
    }

    pub fn binding(&self) -> DeviceBinding {
        DeviceBinding::new(self.user_id, self.material_id, self.device_id)
    }
}

impl fmt::Debug for ContentEncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentEncryptionKey")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("material_id", &self.material_id)
            .field("device_id", &self.device_id)
            .field("encrypted_key", &format_args!("<{} bytes>", self.encrypted_key.len()))
            .field("key_version", &self.key_version)
            .field("created_at", &self.created_at)
            .finish()
    }
}
