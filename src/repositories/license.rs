use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    models::cek::DeviceBinding,
    models::license::{
        interval_literal, parse_grace_period, License, LicenseState, LicenseStatus,
        DEFAULT_OFFLINE_GRACE_HOURS,
    },
};

/// Persistence for licenses. Every mutating method is a single conditional
/// update; `false`/`0` means the precondition did not hold.
#[async_trait]
pub trait LicenseRepository: Send + Sync {
    /// Inserts a new license. Fails `Conflict` when an active license already
    /// exists for the same binding.
    async fn insert(&self, license: &License) -> Result<()>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<License>>;

    async fn find_active_by_binding(&self, binding: DeviceBinding) -> Result<Option<License>>;

    /// Active licenses for a device, newest first.
    async fn list_active_by_device(&self, device_id: Uuid) -> Result<Vec<License>>;

    /// Active licenses for a user, newest first.
    async fn list_active_by_user(&self, user_id: Uuid) -> Result<Vec<License>>;

    /// Replaces the nonce and stamps `last_validated_at`, only if the license
    /// is active and still carries `expected_nonce`.
    async fn rotate_nonce(
        &self,
        id: Uuid,
        expected_nonce: &str,
        next_nonce: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Moves `expires_at` forward, only if active and `new_expiry` is later.
    async fn extend_expiry(&self, id: Uuid, new_expiry: DateTime<Utc>) -> Result<bool>;

    /// Revokes one license, only if not already revoked.
    async fn revoke(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    async fn revoke_by_device(&self, device_id: Uuid, now: DateTime<Utc>) -> Result<u64>;

    async fn revoke_by_material(&self, material_id: Uuid, now: DateTime<Utc>) -> Result<u64>;

    async fn revoke_by_user_and_material(
        &self,
        user_id: Uuid,
        material_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64>;
}

/// Postgres-backed license repository over `offline_licenses`.
#[derive(Clone)]
pub struct PgLicenseRepository {
    pool: Pool,
    lenient_grace_parsing: bool,
}

impl PgLicenseRepository {
    /// # Arguments
    ///
    /// * `pool` - The database connection pool.
    /// * `lenient_grace_parsing` - Substitute the 72h default for grace periods
    ///   that cannot be parsed instead of failing the read.
    pub fn new(pool: Pool, lenient_grace_parsing: bool) -> Self {
        Self { pool, lenient_grace_parsing }
    }

    fn row_to_license(&self, row: &Row) -> Result<License> {
        let id: Uuid = row.try_get("id")?;
        let status: LicenseStatus = row.try_get("status")?;
        let revoked_at: Option<DateTime<Utc>> = row.try_get("revoked_at")?;
        let raw_grace: String = row.try_get("offline_grace_period")?;

        let offline_grace_period = match parse_grace_period(&raw_grace) {
            Some(d) => d,
            None if self.lenient_grace_parsing => {
                tracing::warn!(
                    license_id = %id,
                    raw = %raw_grace,
                    "Unparsable grace period, substituting default"
                );
                chrono::Duration::hours(DEFAULT_OFFLINE_GRACE_HOURS)
            }
            None => {
                return Err(AppError::Internal(format!(
                    "license {} has unparsable grace period {:?}",
                    id, raw_grace
                )))
            }
        };

        Ok(License {
            id,
            user_id: row.try_get("user_id")?,
            material_id: row.try_get("material_id")?,
            device_id: row.try_get("device_id")?,
            state: LicenseState::from_columns(status, revoked_at)?,
            expires_at: row.try_get("expires_at")?,
            offline_grace_period,
            last_validated_at: row.try_get("last_validated_at")?,
            nonce: row.try_get("nonce")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn rows_to_licenses(&self, rows: &[Row]) -> Result<Vec<License>> {
        rows.iter().map(|r| self.row_to_license(r)).collect()
    }
}

#[async_trait]
impl LicenseRepository for PgLicenseRepository {
    async fn insert(&self, license: &License) -> Result<()> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                INSERT INTO offline_licenses (
                    id, user_id, material_id, device_id, status, expires_at,
                    offline_grace_period, last_validated_at, nonce, created_at, revoked_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7::text::interval, $8, $9, $10, $11)
                "#,
            )
            .await?;
        client
            .execute(
                &stmt,
                &[
                    &license.id,
                    &license.user_id,
                    &license.material_id,
                    &license.device_id,
                    &license.status(),
                    &license.expires_at,
                    &interval_literal(license.offline_grace_period),
                    &license.last_validated_at,
                    &license.nonce,
                    &license.created_at,
                    &license.revoked_at(),
                ],
            )
            .await
            .map_err(|e| AppError::from_insert(e, "active license"))?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<License>> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                SELECT id, user_id, material_id, device_id, status, expires_at,
                       offline_grace_period::text AS offline_grace_period,
                       last_validated_at, nonce, created_at, revoked_at
                FROM offline_licenses
                WHERE id = $1
                "#,
            )
            .await?;
        let row = client.query_opt(&stmt, &[&id]).await?;
        row.map(|r| self.row_to_license(&r)).transpose()
    }

    async fn find_active_by_binding(&self, binding: DeviceBinding) -> Result<Option<License>> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                SELECT id, user_id, material_id, device_id, status, expires_at,
                       offline_grace_period::text AS offline_grace_period,
                       last_validated_at, nonce, created_at, revoked_at
                FROM offline_licenses
                WHERE user_id = $1 AND material_id = $2 AND device_id = $3
                  AND revoked_at IS NULL
                "#,
            )
            .await?;
        let row = client
            .query_opt(&stmt, &[&binding.user_id, &binding.material_id, &binding.device_id])
            .await?;
        row.map(|r| self.row_to_license(&r)).transpose()
    }

    async fn list_active_by_device(&self, device_id: Uuid) -> Result<Vec<License>> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                SELECT id, user_id, material_id, device_id, status, expires_at,
                       offline_grace_period::text AS offline_grace_period,
                       last_validated_at, nonce, created_at, revoked_at
                FROM offline_licenses
                WHERE device_id = $1 AND revoked_at IS NULL
                ORDER BY created_at DESC
                "#,
            )
            .await?;
        let rows = client.query(&stmt, &[&device_id]).await?;
        self.rows_to_licenses(&rows)
    }

    async fn list_active_by_user(&self, user_id: Uuid) -> Result<Vec<License>> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                SELECT id, user_id, material_id, device_id, status, expires_at,
                       offline_grace_period::text AS offline_grace_period,
                       last_validated_at, nonce, created_at, revoked_at
                FROM offline_licenses
                WHERE user_id = $1 AND revoked_at IS NULL
                ORDER BY created_at DESC
                "#,
            )
            .await?;
        let rows = client.query(&stmt, &[&user_id]).await?;
        self.rows_to_licenses(&rows)
    }

    async fn rotate_nonce(
        &self,
        id: Uuid,
        expected_nonce: &str,
        next_nonce: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                UPDATE offline_licenses
                SET nonce = $3, last_validated_at = $4
                WHERE id = $1 AND nonce = $2 AND status = 'active' AND revoked_at IS NULL
                "#,
            )
            .await?;
        let affected = client
            .execute(&stmt, &[&id, &expected_nonce, &next_nonce, &now])
            .await?;
        Ok(affected == 1)
    }

    async fn extend_expiry(&self, id: Uuid, new_expiry: DateTime<Utc>) -> Result<bool> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                UPDATE offline_licenses
                SET expires_at = $2
                WHERE id = $1 AND status = 'active' AND revoked_at IS NULL
                  AND expires_at < $2
                "#,
            )
            .await?;
        let affected = client.execute(&stmt, &[&id, &new_expiry]).await?;
        Ok(affected == 1)
    }

    async fn revoke(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                UPDATE offline_licenses
                SET status = 'revoked', revoked_at = $2
                WHERE id = $1 AND revoked_at IS NULL
                "#,
            )
            .await?;
        let affected = client.execute(&stmt, &[&id, &now]).await?;
        Ok(affected == 1)
    }

    async fn revoke_by_device(&self, device_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                UPDATE offline_licenses
                SET status = 'revoked', revoked_at = $2
                WHERE device_id = $1 AND revoked_at IS NULL
                "#,
            )
            .await?;
        Ok(client.execute(&stmt, &[&device_id, &now]).await?)
    }

    async fn revoke_by_material(&self, material_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                UPDATE offline_licenses
                SET status = 'revoked', revoked_at = $2
                WHERE material_id = $1 AND revoked_at IS NULL
                "#,
            )
            .await?;
        Ok(client.execute(&stmt, &[&material_id, &now]).await?)
    }

    async fn revoke_by_user_and_material(
        &self,
        user_id: Uuid,
        material_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                UPDATE offline_licenses
                SET status = 'revoked', revoked_at = $3
                WHERE user_id = $1 AND material_id = $2 AND revoked_at IS NULL
                "#,
            )
            .await?;
        Ok(client.execute(&stmt, &[&user_id, &material_id, &now]).await?)
    }
}
