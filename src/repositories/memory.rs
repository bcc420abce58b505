use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    models::{
        cek::{ContentEncryptionKey, DeviceBinding},
        job::{EncryptionJob, JobStatus},
        license::{License, LicenseState},
    },
    repositories::{cek::CekRepository, job::JobRepository, license::LicenseRepository},
};

#[derive(Default)]
struct Tables {
    licenses: Vec<License>,
    ceks: Vec<ContentEncryptionKey>,
    jobs: Vec<EncryptionJob>,
}

impl Tables {
    fn license_mut(&mut self, id: Uuid) -> Option<&mut License> {
        self.licenses.iter_mut().find(|l| l.id == id)
    }

    fn job_mut(&mut self, id: Uuid) -> Option<&mut EncryptionJob> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    fn revoke_where(&mut self, now: DateTime<Utc>, pred: impl Fn(&License) -> bool) -> u64 {
        let mut revoked = 0;
        for license in self.licenses.iter_mut().filter(|l| l.is_active() && pred(l)) {
            license.state = LicenseState::Revoked { at: now };
            revoked += 1;
        }
        revoked
    }

    fn delete_ceks_where(&mut self, pred: impl Fn(&ContentEncryptionKey) -> bool) -> u64 {
        let before = self.ceks.len();
        self.ceks.retain(|c| !pred(c));
        (before - self.ceks.len()) as u64
    }
}

/// In-process store for licenses, CEKs and jobs.
///
/// All three tables sit behind one lock, so every repository call is atomic
/// with respect to every other; the conditional semantics match the Postgres
/// repositories row for row. Clones share the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first<T: Clone>(mut rows: Vec<T>, created_at: impl Fn(&T) -> DateTime<Utc>) -> Vec<T> {
    // ties: most recently inserted first
    rows.reverse();
    rows.sort_by(|a, b| created_at(b).cmp(&created_at(a)));
    rows
}

#[async_trait]
impl LicenseRepository for MemoryStore {
    async fn insert(&self, license: &License) -> Result<()> {
        let mut t = self.inner.lock().await;
        let taken = t.licenses.iter().any(|l| {
            l.is_active() && l.binds(license.user_id, license.material_id, license.device_id)
        });
        if license.is_active() && taken {
            return Err(AppError::Conflict(
                "active license already exists for this binding".to_string(),
            ));
        }
        t.licenses.push(license.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<License>> {
        let t = self.inner.lock().await;
        Ok(t.licenses.iter().find(|l| l.id == id).cloned())
    }

    async fn find_active_by_binding(&self, binding: DeviceBinding) -> Result<Option<License>> {
        let t = self.inner.lock().await;
        Ok(t.licenses
            .iter()
            .find(|l| {
                l.is_active() && l.binds(binding.user_id, binding.material_id, binding.device_id)
            })
            .cloned())
    }

    async fn list_active_by_device(&self, device_id: Uuid) -> Result<Vec<License>> {
        let t = self.inner.lock().await;
        let rows = t
            .licenses
            .iter()
            .filter(|l| l.is_active() && l.device_id == device_id)
            .cloned()
            .collect();
        Ok(newest_first(rows, |l: &License| l.created_at))
    }

    async fn list_active_by_user(&self, user_id: Uuid) -> Result<Vec<License>> {
        let t = self.inner.lock().await;
        let rows = t
            .licenses
            .iter()
            .filter(|l| l.is_active() && l.user_id == user_id)
            .cloned()
            .collect();
        Ok(newest_first(rows, |l: &License| l.created_at))
    }

    async fn rotate_nonce(
        &self,
        id: Uuid,
        expected_nonce: &str,
        next_nonce: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut t = self.inner.lock().await;
        match t.license_mut(id) {
            Some(l) if l.is_active() && l.nonce == expected_nonce => {
                l.nonce = next_nonce.to_string();
                l.last_validated_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend_expiry(&self, id: Uuid, new_expiry: DateTime<Utc>) -> Result<bool> {
        let mut t = self.inner.lock().await;
        match t.license_mut(id) {
            Some(l) if l.is_active() && l.expires_at < new_expiry => {
                l.expires_at = new_expiry;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut t = self.inner.lock().await;
        Ok(t.revoke_where(now, |l| l.id == id) == 1)
    }

    async fn revoke_by_device(&self, device_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        let mut t = self.inner.lock().await;
        Ok(t.revoke_where(now, |l| l.device_id == device_id))
    }

    async fn revoke_by_material(&self, material_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        let mut t = self.inner.lock().await;
        Ok(t.revoke_where(now, |l| l.material_id == material_id))
    }

    async fn revoke_by_user_and_material(
        &self,
        user_id: Uuid,
        material_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut t = self.inner.lock().await;
        Ok(t.revoke_where(now, |l| l.user_id == user_id && l.material_id == material_id))
    }
}

#[async_trait]
impl CekRepository for MemoryStore {
    async fn insert(&self, cek: &ContentEncryptionKey) -> Result<()> {
        let mut t = self.inner.lock().await;
        if t.ceks.iter().any(|c| c.binding() == cek.binding()) {
            return Err(AppError::Conflict("CEK already exists for this binding".to_string()));
        }
        t.ceks.push(cek.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ContentEncryptionKey>> {
        let t = self.inner.lock().await;
        Ok(t.ceks.iter().find(|c| c.id == id).cloned())
    }

    async fn find_by_binding(&self, binding: DeviceBinding) -> Result<Option<ContentEncryptionKey>> {
        let t = self.inner.lock().await;
        Ok(t.ceks.iter().find(|c| c.binding() == binding).cloned())
    }

    async fn update_key(&self, id: Uuid, encrypted_key: &[u8], new_version: i32) -> Result<bool> {
        let mut t = self.inner.lock().await;
        match t.ceks.iter_mut().find(|c| c.id == id) {
            Some(c) if c.key_version < new_version => {
                c.encrypted_key = encrypted_key.to_vec();
                c.key_version = new_version;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_by_key_version(&self, key_version: i32) -> Result<Vec<ContentEncryptionKey>> {
        let t = self.inner.lock().await;
        let mut rows: Vec<_> = t
            .ceks
            .iter()
            .filter(|c| c.key_version == key_version)
            .cloned()
            .collect();
        rows.sort_by_key(|c| c.created_at);
        Ok(rows)
    }

    async fn delete_by_device(&self, device_id: Uuid) -> Result<u64> {
        let mut t = self.inner.lock().await;
        Ok(t.delete_ceks_where(|c| c.device_id == device_id))
    }

    async fn delete_by_material(&self, material_id: Uuid) -> Result<u64> {
        let mut t = self.inner.lock().await;
        Ok(t.delete_ceks_where(|c| c.material_id == material_id))
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn insert(&self, job: &EncryptionJob) -> Result<()> {
        let mut t = self.inner.lock().await;
        if t.jobs.iter().any(|j| j.id == job.id) {
            return Err(AppError::Conflict(format!("job {} already exists", job.id)));
        }
        t.jobs.push(job.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<EncryptionJob>> {
        let t = self.inner.lock().await;
        Ok(t.jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn list_by_license(&self, license_id: Uuid) -> Result<Vec<EncryptionJob>> {
        let t = self.inner.lock().await;
        let rows = t
            .jobs
            .iter()
            .filter(|j| j.license_id == Some(license_id))
            .cloned()
            .collect();
        Ok(newest_first(rows, |j: &EncryptionJob| j.created_at))
    }

    async fn claim_pending(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<EncryptionJob>> {
        let mut t = self.inner.lock().await;
        // Insertion order breaks created_at ties, so the sort must stay stable.
        let mut order: Vec<usize> = (0..t.jobs.len())
            .filter(|&i| t.jobs[i].status == JobStatus::Pending)
            .collect();
        order.sort_by_key(|&i| (t.jobs[i].priority, t.jobs[i].created_at));

        let mut claimed = Vec::with_capacity(limit.min(order.len()));
        for i in order.into_iter().take(limit) {
            if t.jobs[i].begin(now) {
                claimed.push(t.jobs[i].clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut t = self.inner.lock().await;
        Ok(t.job_mut(id).is_some_and(|j| j.complete(now)))
    }

    async fn fail(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut t = self.inner.lock().await;
        Ok(t.job_mut(id).is_some_and(|j| j.fail(error, now)))
    }

    async fn retry(&self, id: Uuid) -> Result<bool> {
        let mut t = self.inner.lock().await;
        Ok(t.job_mut(id).is_some_and(|j| j.reset_for_retry()))
    }

    async fn fail_stale(
        &self,
        started_before: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<EncryptionJob>> {
        let mut t = self.inner.lock().await;
        let mut failed = Vec::new();
        for job in t.jobs.iter_mut() {
            let stale = job.status == JobStatus::Processing
                && job.started_at.is_some_and(|s| s < started_before);
            if stale && job.fail(error, now) {
                failed.push(job.clone());
            }
        }
        Ok(failed)
    }

    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut t = self.inner.lock().await;
        let before = t.jobs.len();
        t.jobs.retain(|j| {
            !(j.status == JobStatus::Completed && j.completed_at.is_some_and(|c| c < cutoff))
        });
        Ok((before - t.jobs.len()) as u64)
    }
}
