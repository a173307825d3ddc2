mod common;

use manifold_backend_sqlx::Error;
use manifold_core::blobs::{BlobRepository, RegistryBlobRepository};
use manifold_core::manifests::{LayerRepository, ManifestRepository};
use manifold_core::registries::{NewRegistry, RegistryRepository};
use manifold_core::{BlobId, CreateOrFind, Error as CoreError};

use common::*;

#[tokio::test]
async fn concurrent_pushes_of_identical_content_share_one_row() {
    let db = sqlite().await;
    let registry = root_registry(&db.pool, "tenant").await;
    let blob = new_blob(registry.root_parent_id, digest('a'), 100);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = db.pool.clone();
        let blob = blob.clone();
        handles.push(tokio::spawn(async move {
            pool.with_tx(write_opts(), move |tx| {
                Box::pin(async move { Ok::<_, Error>(tx.create_or_find_blob(&blob).await?) })
            })
            .await
            .unwrap()
        }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }

    assert_eq!(outcomes.iter().filter(|o| o.is_created()).count(), 1);
    let first = outcomes[0].get().id;
    assert!(outcomes.iter().all(|o| o.get().id == first));

    let mut conn = db.pool.conn(None).await.unwrap();
    assert_eq!(
        conn.total_size_by_root_parent_id(registry.root_parent_id)
            .await
            .unwrap(),
        100
    );
}

#[tokio::test]
async fn same_digest_in_another_tenant_is_a_separate_row() {
    let db = sqlite().await;
    let a = root_registry(&db.pool, "a").await;
    let b = root_registry(&db.pool, "b").await;
    let mut conn = db.pool.conn(None).await.unwrap();

    let in_a = conn
        .create_or_find_blob(&new_blob(a.root_parent_id, digest('a'), 10))
        .await
        .unwrap();
    let in_b = conn
        .create_or_find_blob(&new_blob(b.root_parent_id, digest('a'), 10))
        .await
        .unwrap();

    assert!(in_a.is_created());
    assert!(in_b.is_created());
    assert_ne!(in_a.get().id, in_b.get().id);
}

#[tokio::test]
async fn child_registries_share_the_root_tenant() {
    let db = sqlite().await;
    let root = root_registry(&db.pool, "org").await;
    let mut conn = db.pool.conn(None).await.unwrap();
    let child = conn
        .create_registry(&NewRegistry {
            parent_id: Some(root.id),
            name: "team".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(root.root_parent_id, root.id);
    assert_eq!(child.root_parent_id, root.id);

    let created = conn
        .create_or_find_blob(&new_blob(child.root_parent_id, digest('c'), 5))
        .await
        .unwrap();
    let found = conn
        .create_or_find_blob(&new_blob(root.root_parent_id, digest('c'), 5))
        .await
        .unwrap();
    assert!(matches!(found, CreateOrFind::Found(_)));
    assert_eq!(created.get().id, found.get().id);
}

#[tokio::test]
async fn total_size_of_empty_tenant_is_zero() {
    let db = sqlite().await;
    let registry = root_registry(&db.pool, "empty").await;
    let mut conn = db.pool.conn(None).await.unwrap();

    assert_eq!(
        conn.total_size_by_root_parent_id(registry.root_parent_id)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn lookups_distinguish_missing_blobs() {
    let db = sqlite().await;
    let registry = root_registry(&db.pool, "tenant").await;
    let mut conn = db.pool.conn(None).await.unwrap();

    let err = conn
        .find_blob_by_digest_and_root_parent_id(&digest('f'), registry.root_parent_id)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = conn.find_blob_by_id(BlobId::new(42)).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn blob_links_scope_existence_to_an_image() {
    let db = sqlite().await;
    let registry = root_registry(&db.pool, "tenant").await;
    let mut conn = db.pool.conn(None).await.unwrap();
    let blob = conn
        .create_or_find_blob(&new_blob(registry.root_parent_id, digest('b'), 7))
        .await
        .unwrap()
        .into_inner();

    assert!(!conn.exists_blob(registry.id, &blob.digest, "app").await.unwrap());
    assert!(conn.link_blob(registry.id, blob.id, "app").await.unwrap());
    assert!(!conn.link_blob(registry.id, blob.id, "app").await.unwrap());
    assert!(conn.exists_blob(registry.id, &blob.digest, "app").await.unwrap());
    assert!(!conn.exists_blob(registry.id, &blob.digest, "other").await.unwrap());

    let found = conn
        .find_blob_by_digest_and_repo_id(&blob.digest, registry.id, "app")
        .await
        .unwrap();
    assert_eq!(found, blob);

    assert_eq!(
        conn.unlink_blobs_by_image_name(registry.id, "app")
            .await
            .unwrap(),
        1
    );
    assert!(!conn.exists_blob(registry.id, &blob.digest, "app").await.unwrap());
}

#[tokio::test]
async fn referenced_blob_cannot_be_deleted() {
    let db = sqlite().await;
    let registry = root_registry(&db.pool, "tenant").await;
    let mut conn = db.pool.conn(None).await.unwrap();
    let blob = conn
        .create_or_find_blob(&new_blob(registry.root_parent_id, digest('b'), 7))
        .await
        .unwrap()
        .into_inner();
    let manifest = conn
        .create_manifest(&new_manifest(registry.id, "app", digest('1')))
        .await
        .unwrap();
    conn.associate_layer_blob(&manifest, &blob).await.unwrap();

    let err = conn.delete_blob_by_id(blob.id).await.unwrap_err();
    assert!(matches!(err, CoreError::ContentReferenced));

    assert!(conn.dissociate_layer_blob(&manifest, &blob).await.unwrap());
    conn.delete_blob_by_id(blob.id).await.unwrap();
    assert!(conn.find_blob_by_id(blob.id).await.unwrap_err().is_not_found());
}
