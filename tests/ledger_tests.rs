mod common;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use common::{triple, TestContext};
use offline_access::error::{AppError, Result};
use offline_access::models::cek::DeviceBinding;
use offline_access::models::license::{parse_grace_period, License};
use offline_access::repositories::license::LicenseRepository;
use offline_access::repositories::memory::MemoryStore;
use offline_access::services::ledger::{LedgerConfig, LicenseLedger};

/// What happens to a license between a validation reading it and rotating its nonce.
#[derive(Clone, Copy)]
enum Rival {
    Validation,
    Revocation,
}

/// A license store where a rival always acts just before each nonce rotation.
struct RacingLicenses {
    inner: MemoryStore,
    rival: Rival,
}

#[async_trait]
impl LicenseRepository for RacingLicenses {
    async fn insert(&self, license: &License) -> Result<()> {
        LicenseRepository::insert(&self.inner, license).await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<License>> {
        LicenseRepository::find_by_id(&self.inner, id).await
    }

    async fn find_active_by_binding(&self, binding: DeviceBinding) -> Result<Option<License>> {
        self.inner.find_active_by_binding(binding).await
    }

    async fn list_active_by_device(&self, device_id: Uuid) -> Result<Vec<License>> {
        self.inner.list_active_by_device(device_id).await
    }

    async fn list_active_by_user(&self, user_id: Uuid) -> Result<Vec<License>> {
        self.inner.list_active_by_user(user_id).await
    }

    async fn rotate_nonce(
        &self,
        id: Uuid,
        expected_nonce: &str,
        next_nonce: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        match self.rival {
            Rival::Validation => {
                self.inner.rotate_nonce(id, expected_nonce, "rival-nonce", now).await?;
            }
            Rival::Revocation => {
                LicenseRepository::revoke(&self.inner, id, now).await?;
            }
        }
        self.inner.rotate_nonce(id, expected_nonce, next_nonce, now).await
    }

    async fn extend_expiry(&self, id: Uuid, new_expiry: DateTime<Utc>) -> Result<bool> {
        self.inner.extend_expiry(id, new_expiry).await
    }

    async fn revoke(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        LicenseRepository::revoke(&self.inner, id, now).await
    }

    async fn revoke_by_device(&self, device_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        self.inner.revoke_by_device(device_id, now).await
    }

    async fn revoke_by_material(&self, material_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        self.inner.revoke_by_material(material_id, now).await
    }

    async fn revoke_by_user_and_material(
        &self,
        user_id: Uuid,
        material_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.inner.revoke_by_user_and_material(user_id, material_id, now).await
    }
}

fn racing_ledger(context: &TestContext, rival: Rival) -> LicenseLedger {
    LicenseLedger::new(
        Arc::new(RacingLicenses { inner: context.store.clone(), rival }),
        Arc::new(context.clock.clone()),
        LedgerConfig::default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_active_license_for_triple_conflicts() {
        let context = TestContext::new();
        let (user, material, device) = triple();

        let first = context.ledger.issue(user, material, device, None).await.unwrap();
        assert!(first.is_active());
        assert_eq!(first.expires_at, TestContext::start() + Duration::days(30));
        assert_eq!(first.offline_grace_period, Duration::hours(72));
        assert!(first.last_validated_at.is_none());
        assert_eq!(first.nonce.len(), 64);

        let second = context.ledger.issue(user, material, device, None).await;
        assert!(matches!(second, Err(AppError::Conflict(_))));

        // A different device is a different triple
        let (_, _, other_device) = triple();
        context.ledger.issue(user, material, other_device, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_issue_is_allowed_again_after_revocation() {
        let context = TestContext::new();
        let (user, material, device) = triple();

        let first = context.ledger.issue(user, material, device, None).await.unwrap();
        assert!(context.ledger.revoke(first.id).await.unwrap());

        let second = context.ledger.issue(user, material, device, None).await.unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_issue_rejects_negative_grace() {
        let context = TestContext::new();
        let (user, material, device) = triple();
        let result = context
            .ledger
            .issue(user, material, device, Some(Duration::hours(-1)))
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_revocation_is_terminal() {
        let context = TestContext::new();
        let (user, material, device) = triple();
        let license = context.ledger.issue(user, material, device, None).await.unwrap();

        // Step 1: Revoke once
        assert!(context.ledger.revoke(license.id).await.unwrap());
        let revoked = context.ledger.get(license.id).await.unwrap();
        let revoked_at = revoked.revoked_at().unwrap();
        assert_eq!(revoked_at, TestContext::start());

        // Step 2: Validation fails Revoked, even with the right nonce
        let result = context.ledger.validate(license.id, &license.nonce).await;
        assert!(matches!(result, Err(AppError::Revoked)));

        // Step 3: Revoking again is a no-op that keeps the first instant
        context.clock.advance(Duration::hours(5));
        assert!(!context.ledger.revoke(license.id).await.unwrap());
        let still = context.ledger.get(license.id).await.unwrap();
        assert_eq!(still.revoked_at(), Some(revoked_at));

        // Step 4: Renewal cannot resurrect it
        let renew = context
            .ledger
            .renew(license.id, license.expires_at + Duration::days(10))
            .await;
        assert!(matches!(renew, Err(AppError::Revoked)));

        let result = context.ledger.validate(license.id, &license.nonce).await;
        assert!(matches!(result, Err(AppError::Revoked)));
        assert!(!context.ledger.get(license.id).await.unwrap().is_active());
    }

    #[tokio::test]
    async fn test_revoke_unknown_license_is_not_found() {
        let context = TestContext::new();
        let result = context.ledger.revoke(uuid::Uuid::new_v4()).await;
        assert!(matches!(result, Err(AppError::NotFound)));
    }

    #[tokio::test]
    async fn test_validate_unknown_license_is_not_found() {
        let context = TestContext::new();
        let result = context.ledger.validate(uuid::Uuid::new_v4(), "whatever").await;
        assert!(matches!(result, Err(AppError::NotFound)));
    }

    #[tokio::test]
    async fn test_grace_boundary_in_minutes() {
        let context = TestContext::new();
        let (user, material, device) = triple();
        let license = context.ledger.issue(user, material, device, None).await.unwrap();
        let expiry = license.expires_at;

        // T + 71h59m validates
        context.clock.set(expiry + Duration::hours(71) + Duration::minutes(59));
        let ok = context.ledger.validate(license.id, &license.nonce).await.unwrap();

        // T + 72h1m is expired, even though the license was just validated
        context.clock.set(expiry + Duration::hours(72) + Duration::minutes(1));
        let result = context.ledger.validate(license.id, &ok.next_nonce).await;
        assert!(matches!(result, Err(AppError::Expired)));
    }

    #[tokio::test]
    async fn test_grace_boundary_in_seconds() {
        let context = TestContext::new();
        let (user, material, device) = triple();
        let grace = Duration::hours(72);
        let license = context.ledger.issue(user, material, device, Some(grace)).await.unwrap();
        let deadline = license.expires_at + grace;

        context.clock.set(deadline - Duration::seconds(1));
        let first = context.ledger.validate(license.id, &license.nonce).await.unwrap();

        // The deadline itself still validates
        context.clock.set(deadline);
        let second = context.ledger.validate(license.id, &first.next_nonce).await.unwrap();

        context.clock.set(deadline + Duration::seconds(1));
        let result = context.ledger.validate(license.id, &second.next_nonce).await;
        assert!(matches!(result, Err(AppError::Expired)));
    }

    #[tokio::test]
    async fn test_zero_grace_expires_right_after_expiry() {
        let context = TestContext::new();
        let (user, material, device) = triple();
        let license = context
            .ledger
            .issue(user, material, device, Some(Duration::zero()))
            .await
            .unwrap();

        context.clock.set(license.expires_at + Duration::seconds(1));
        let result = context.ledger.validate(license.id, &license.nonce).await;
        assert!(matches!(result, Err(AppError::Expired)));
    }

    #[tokio::test]
    async fn test_nonce_rotation_and_replay() {
        let context = TestContext::new();
        let (user, material, device) = triple();
        let license = context.ledger.issue(user, material, device, None).await.unwrap();
        let nonce_0 = license.nonce.clone();

        // Step 1: First validation rotates the nonce
        context.clock.advance(Duration::hours(1));
        let first = context.ledger.validate(license.id, &nonce_0).await.unwrap();
        let nonce_1 = first.next_nonce.clone();
        assert_ne!(nonce_1, nonce_0);
        assert_eq!(first.license.nonce, nonce_1);
        assert_eq!(first.license.last_validated_at, Some(context.clock_now()));

        // Step 2: Replaying nonce_0 is rejected and does not disturb nonce_1
        let replay = context.ledger.validate(license.id, &nonce_0).await;
        assert!(matches!(replay, Err(AppError::StaleNonce)));
        assert_eq!(context.ledger.get(license.id).await.unwrap().nonce, nonce_1);

        // Step 3: The current nonce still works
        let second = context.ledger.validate(license.id, &nonce_1).await.unwrap();
        assert_ne!(second.next_nonce, nonce_1);
        assert_ne!(second.next_nonce, nonce_0);
    }

    #[tokio::test]
    async fn test_concurrent_validation_with_one_nonce_succeeds_once() {
        let context = TestContext::new();
        let (user, material, device) = triple();
        let license = context.ledger.issue(user, material, device, None).await.unwrap();

        let (a, b) = tokio::join!(
            context.ledger.validate(license.id, &license.nonce),
            context.ledger.validate(license.id, &license.nonce),
        );

        let results = [a, b];
        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(AppError::StaleNonce))));
    }

    #[tokio::test]
    async fn test_renew_only_moves_forward() {
        let context = TestContext::new();
        let (user, material, device) = triple();
        let license = context.ledger.issue(user, material, device, None).await.unwrap();

        let earlier = context.ledger.renew(license.id, license.expires_at - Duration::days(1)).await;
        assert!(matches!(earlier, Err(AppError::InvalidTransition(_))));

        let same = context.ledger.renew(license.id, license.expires_at).await;
        assert!(matches!(same, Err(AppError::InvalidTransition(_))));

        let later = license.expires_at + Duration::days(30);
        let renewed = context.ledger.renew(license.id, later).await.unwrap();
        assert_eq!(renewed.expires_at, later);
        assert_eq!(context.ledger.get(license.id).await.unwrap().expires_at, later);

        let missing = context.ledger.renew(uuid::Uuid::new_v4(), later).await;
        assert!(matches!(missing, Err(AppError::NotFound)));
    }

    #[tokio::test]
    async fn test_expired_license_can_be_renewed() {
        let context = TestContext::new();
        let (user, material, device) = triple();
        let license = context.ledger.issue(user, material, device, None).await.unwrap();

        context.clock.set(license.grace_deadline() + Duration::days(1));
        let expired = context.ledger.validate(license.id, &license.nonce).await;
        assert!(matches!(expired, Err(AppError::Expired)));

        let new_expiry = context.clock_now() + Duration::days(30);
        context.ledger.renew(license.id, new_expiry).await.unwrap();
        context.ledger.validate(license.id, &license.nonce).await.unwrap();
    }

    #[tokio::test]
    async fn test_revoke_all_for_device_is_idempotent() {
        let context = TestContext::new();
        let (user, material, device) = triple();
        let (_, other_material, other_device) = triple();

        context.ledger.issue(user, material, device, None).await.unwrap();
        context.ledger.issue(user, other_material, device, None).await.unwrap();
        context.ledger.issue(user, material, other_device, None).await.unwrap();

        assert_eq!(context.ledger.revoke_all_for_device(device).await.unwrap(), 2);
        assert!(context.ledger.list_active_for_device(device).await.unwrap().is_empty());

        // Second call: same end state, nothing transitioned, no error
        assert_eq!(context.ledger.revoke_all_for_device(device).await.unwrap(), 0);
        assert!(context.ledger.list_active_for_device(device).await.unwrap().is_empty());

        assert_eq!(context.ledger.list_active_for_device(other_device).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bulk_revocation_by_material_and_by_user() {
        let context = TestContext::new();
        let (user, material, device) = triple();
        let (other_user, other_material, other_device) = triple();

        context.ledger.issue(user, material, device, None).await.unwrap();
        context.ledger.issue(other_user, material, other_device, None).await.unwrap();
        let kept = context.ledger.issue(user, other_material, device, None).await.unwrap();

        assert_eq!(
            context.ledger.revoke_all_for_user_and_material(other_user, material).await.unwrap(),
            1
        );
        assert_eq!(context.ledger.revoke_all_for_material(material).await.unwrap(), 1);
        assert_eq!(context.ledger.revoke_all_for_material(material).await.unwrap(), 0);

        let active = context.ledger.list_active_for_user(user).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, kept.id);
    }

    #[tokio::test]
    async fn test_active_listings_are_newest_first() {
        let context = TestContext::new();
        let (user, material, device) = triple();
        let (_, second_material, _) = triple();

        let older = context.ledger.issue(user, material, device, None).await.unwrap();
        context.clock.advance(Duration::minutes(1));
        let newer = context.ledger.issue(user, second_material, device, None).await.unwrap();

        let ids: Vec<_> = context
            .ledger
            .list_active_for_user(user)
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.id)
            .collect();
        assert_eq!(ids, vec![newer.id, older.id]);
    }

    #[tokio::test]
    async fn test_validation_losing_the_rotation_to_another_validation_is_stale() {
        let context = TestContext::new();
        let ledger = racing_ledger(&context, Rival::Validation);
        let (user, material, device) = triple();
        let license = ledger.issue(user, material, device, None).await.unwrap();

        let result = ledger.validate(license.id, &license.nonce).await;
        assert!(matches!(result, Err(AppError::StaleNonce)));
        assert_eq!(context.ledger.get(license.id).await.unwrap().nonce, "rival-nonce");
    }

    #[tokio::test]
    async fn test_validation_losing_the_rotation_to_a_revocation_is_revoked() {
        let context = TestContext::new();
        let ledger = racing_ledger(&context, Rival::Revocation);
        let (user, material, device) = triple();
        let license = ledger.issue(user, material, device, None).await.unwrap();

        let result = ledger.validate(license.id, &license.nonce).await;
        assert!(matches!(result, Err(AppError::Revoked)));
        let stored = context.ledger.get(license.id).await.unwrap();
        assert!(!stored.is_active());
        assert_eq!(stored.nonce, license.nonce);
    }

    #[tokio::test]
    async fn test_issue_rejects_grace_past_the_timestamp_range() {
        let context = TestContext::new();
        let (user, material, device) = triple();

        let huge = parse_grace_period("2147483647 days").unwrap();
        let result = context.ledger.issue(user, material, device, Some(huge)).await;
        assert!(matches!(result, Err(AppError::Validation(_))));

        let result = context.ledger.issue(user, material, device, Some(Duration::MAX)).await;
        assert!(matches!(result, Err(AppError::Validation(_))));

        // Nothing was stored, so a sane request still goes through
        context.ledger.issue(user, material, device, None).await.unwrap();
    }
}
