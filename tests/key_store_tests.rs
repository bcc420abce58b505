mod common;

use common::{triple, TestContext};
use offline_access::crypto::aes;
use offline_access::crypto::kek::KeyWrapper;
use offline_access::error::AppError;
use offline_access::models::cek::DeviceBinding;

fn binding() -> DeviceBinding {
    let (user, material, device) = triple();
    DeviceBinding::new(user, material, device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_creates_version_one_and_rejects_duplicates() {
        let context = TestContext::new();
        let b = binding();

        let cek = context.keys.put(b, vec![1, 2, 3]).await.unwrap();
        assert_eq!(cek.key_version, 1);
        assert_eq!(cek.binding(), b);

        let again = context.keys.put(b, vec![4, 5, 6]).await;
        assert!(matches!(again, Err(AppError::Conflict(_))));

        let stored = context.keys.get(cek.id).await.unwrap();
        assert_eq!(stored.encrypted_key, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_absence_is_not_an_error() {
        let context = TestContext::new();
        let (user, material, device) = triple();

        assert!(context.keys.find(uuid::Uuid::new_v4()).await.unwrap().is_none());
        assert!(context
            .keys
            .find_by_composite(user, material, device)
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            context.keys.get(uuid::Uuid::new_v4()).await,
            Err(AppError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_rotate_requires_a_higher_version() {
        let context = TestContext::new();
        let cek = context.keys.put(binding(), vec![1]).await.unwrap();

        // Step 1: v + 1 replaces bytes and version in place
        context.keys.rotate(cek.id, &[9, 9], 2).await.unwrap();
        let rotated = context.keys.find(cek.id).await.unwrap().unwrap();
        assert_eq!(rotated.id, cek.id);
        assert_eq!(rotated.key_version, 2);
        assert_eq!(rotated.encrypted_key, vec![9, 9]);

        // Step 2: same or lower versions fail and leave the key alone
        for version in [2, 1] {
            let result = context.keys.rotate(cek.id, &[7], version).await;
            assert!(matches!(result, Err(AppError::InvalidTransition(_))));
        }
        assert_eq!(context.keys.get(cek.id).await.unwrap().encrypted_key, vec![9, 9]);

        // Step 3: unknown id
        let missing = context.keys.rotate(uuid::Uuid::new_v4(), &[7], 5).await;
        assert!(matches!(missing, Err(AppError::NotFound)));
    }

    #[tokio::test]
    async fn test_list_by_key_version_and_cascading_deletes() {
        let context = TestContext::new();
        let (user, material, device) = triple();
        let (_, other_material, other_device) = triple();

        let a = context.keys.put(DeviceBinding::new(user, material, device), vec![1]).await.unwrap();
        let b = context
            .keys
            .put(DeviceBinding::new(user, other_material, device), vec![2])
            .await
            .unwrap();
        context
            .keys
            .put(DeviceBinding::new(user, material, other_device), vec![3])
            .await
            .unwrap();
        context.keys.rotate(b.id, &[4], 2).await.unwrap();

        let v1: Vec<_> = context.keys.list_by_key_version(1).await.unwrap();
        assert_eq!(v1.len(), 2);
        assert!(v1.iter().any(|c| c.id == a.id));
        assert_eq!(context.keys.list_by_key_version(2).await.unwrap().len(), 1);

        assert_eq!(context.keys.delete_by_device(device).await.unwrap(), 2);
        assert_eq!(context.keys.delete_by_device(device).await.unwrap(), 0);
        assert_eq!(context.keys.delete_by_material(material).await.unwrap(), 1);
        assert!(context.keys.list_by_key_version(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rotate_all_rewraps_and_counts_failures() {
        let context = TestContext::new();
        let wrapper = TestContext::wrapper(2);

        // Step 1: two good keys wrapped under v1, one corrupted blob
        let mut raw_keys = Vec::new();
        for _ in 0..2 {
            let b = binding();
            let raw = aes::generate_key();
            let wrapped = wrapper.wrap_at(raw.as_bytes(), b, 1).await.unwrap();
            let cek = context.keys.put(b, wrapped).await.unwrap();
            raw_keys.push((cek.id, b, raw.as_bytes().to_vec()));
        }
        let broken = context.keys.put(binding(), vec![0u8; 40]).await.unwrap();

        // Step 2: sweep v1 -> v2
        let report = context.keys.rotate_all(1, wrapper.as_ref()).await.unwrap();
        assert_eq!(report.rotated, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 0);

        // Step 3: rotated keys open under v2 to the same raw key
        for (id, b, raw) in raw_keys {
            let cek = context.keys.get(id).await.unwrap();
            assert_eq!(cek.key_version, 2);
            let opened = wrapper.unwrap(&cek.encrypted_key, b, 2).await.unwrap();
            assert_eq!(opened.as_slice(), raw.as_slice());
        }
        assert_eq!(context.keys.get(broken.id).await.unwrap().key_version, 1);

        // Step 4: a second sweep only sees the broken one
        let report = context.keys.rotate_all(1, wrapper.as_ref()).await.unwrap();
        assert_eq!((report.rotated, report.failed), (0, 1));
    }

    #[tokio::test]
    async fn test_rotate_all_requires_a_newer_kek() {
        let context = TestContext::new();
        let wrapper = TestContext::wrapper(1);
        let result = context.keys.rotate_all(1, wrapper.as_ref()).await;
        assert!(matches!(result, Err(AppError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn test_put_at_version_rejects_zero() {
        let context = TestContext::new();
        let result = context.keys.put_at_version(binding(), vec![1], 0).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
        let cek = context.keys.put_at_version(binding(), vec![1], 3).await.unwrap();
        assert_eq!(cek.key_version, 3);
    }
}
