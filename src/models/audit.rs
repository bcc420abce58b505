use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditAction {
    #[serde(rename = "license.issue")]
    LicenseIssue,
    #[serde(rename = "license.validate")]
    LicenseValidate,
    #[serde(rename = "license.renew")]
    LicenseRenew,
    #[serde(rename = "license.revoke")]
    LicenseRevoke,
    #[serde(rename = "device.deregister")]
    DeviceDeregister,
    #[serde(rename = "material.withdraw")]
    MaterialWithdraw,
    #[serde(rename = "key.generate")]
    KeyGenerate,
    #[serde(rename = "key.rotate")]
    KeyRotate,
    #[serde(rename = "material.encrypt")]
    MaterialEncrypt,
}

/// One outcome of an issuance, validation, renewal or revocation.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub device_id: Option<Uuid>,
    pub action: AuditAction,
    pub resource_id: Option<Uuid>,
    pub success: bool,
    pub reason_code: Option<&'static str>,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn success(action: AuditAction, resource_id: Option<Uuid>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: None,
            device_id: None,
            action,
            resource_id,
            success: true,
            reason_code: None,
            created_at: now,
        }
    }

    pub fn failure(
        action: AuditAction,
        resource_id: Option<Uuid>,
        reason_code: &'static str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            success: false,
            reason_code: Some(reason_code),
            ..Self::success(action, resource_id, now)
        }
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_device(mut self, device_id: Uuid) -> Self {
        self.device_id = Some(device_id);
        self
    }
}
