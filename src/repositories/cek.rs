use async_trait::async_trait;
use deadpool_postgres::Pool;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::{
    error::{AppError, Result},
    models::cek::{ContentEncryptionKey, DeviceBinding},
};

/// Persistence for wrapped CEKs, at most one per binding.
#[async_trait]
pub trait CekRepository: Send + Sync {
    /// Fails `Conflict` when a CEK already exists for the binding.
    async fn insert(&self, cek: &ContentEncryptionKey) -> Result<()>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ContentEncryptionKey>>;

    async fn find_by_binding(&self, binding: DeviceBinding) -> Result<Option<ContentEncryptionKey>>;

    /// Replaces the wrapped key, only if `new_version` is above the stored one.
    async fn update_key(&self, id: Uuid, encrypted_key: &[u8], new_version: i32) -> Result<bool>;

    async fn list_by_key_version(&self, key_version: i32) -> Result<Vec<ContentEncryptionKey>>;

    async fn delete_by_device(&self, device_id: Uuid) -> Result<u64>;

    async fn delete_by_material(&self, material_id: Uuid) -> Result<u64>;
}

/// A helper function to map a `tokio_postgres::Row` to a `ContentEncryptionKey`.
fn row_to_cek(row: &Row) -> Result<ContentEncryptionKey> {
    Ok(ContentEncryptionKey {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        material_id: row.try_get("material_id")?,
        device_id: row.try_get("device_id")?,
        encrypted_key: row.try_get("encrypted_key")?,
        key_version: row.try_get("key_version")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Postgres-backed CEK repository over `offline_ceks`.
#[derive(Clone)]
pub struct PgCekRepository {
    pool: Pool,
}

impl PgCekRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CekRepository for PgCekRepository {
    async fn insert(&self, cek: &ContentEncryptionKey) -> Result<()> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                INSERT INTO offline_ceks (
                    id, user_id, material_id, device_id, encrypted_key, key_version, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .await?;
        client
            .execute(
                &stmt,
                &[
                    &cek.id,
                    &cek.user_id,
                    &cek.material_id,
                    &cek.device_id,
                    &cek.encrypted_key,
                    &cek.key_version,
                    &cek.created_at,
                ],
            )
            .await
            .map_err(|e| AppError::from_insert(e, "CEK"))?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ContentEncryptionKey>> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                SELECT id, user_id, material_id, device_id, encrypted_key, key_version, created_at
                FROM offline_ceks
                WHERE id = $1
                "#,
            )
            .await?;
        let row = client.query_opt(&stmt, &[&id]).await?;
        row.map(|r| row_to_cek(&r)).transpose()
    }

    async fn find_by_binding(&self, binding: DeviceBinding) -> Result<Option<ContentEncryptionKey>> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                SELECT id, user_id, material_id, device_id, encrypted_key, key_version, created_at
                FROM offline_ceks
                WHERE user_id = $1 AND material_id = $2 AND device_id = $3
                "#,
            )
            .await?;
        let row = client
            .query_opt(&stmt, &[&binding.user_id, &binding.material_id, &binding.device_id])
            .await?;
        row.map(|r| row_to_cek(&r)).transpose()
    }

    async fn update_key(&self, id: Uuid, encrypted_key: &[u8], new_version: i32) -> Result<bool> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                UPDATE offline_ceks
                SET encrypted_key = $2, key_version = $3
                WHERE id = $1 AND key_version < $3
                "#,
            )
            .await?;
        let affected = client
            .execute(&stmt, &[&id, &encrypted_key, &new_version])
            .await?;
        Ok(affected == 1)
    }

    async fn list_by_key_version(&self, key_version: i32) -> Result<Vec<ContentEncryptionKey>> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached(
                r#"
                SELECT id, user_id, material_id, device_id, encrypted_key, key_version, created_at
                FROM offline_ceks
                WHERE key_version = $1
                ORDER BY created_at ASC
                "#,
            )
            .await?;
        let rows = client.query(&stmt, &[&key_version]).await?;
        rows.iter().map(row_to_cek).collect()
    }

    async fn delete_by_device(&self, device_id: Uuid) -> Result<u64> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached("DELETE FROM offline_ceks WHERE device_id = $1")
            .await?;
        Ok(client.execute(&stmt, &[&device_id]).await?)
    }

    async fn delete_by_material(&self, material_id: Uuid) -> Result<u64> {
        let client = self.pool.get().await?;
        let stmt = client
            .prepare_cached("DELETE FROM offline_ceks WHERE material_id = $1")
            .await?;
        Ok(client.execute(&stmt, &[&material_id]).await?)
    }
}
