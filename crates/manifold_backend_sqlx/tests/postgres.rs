//! Runs against a live PostgreSQL when `MANIFOLD_TEST_POSTGRES_URL` is set; skipped otherwise.
mod common;

use manifold_backend_sqlx::metadata::MetadataPool;
use manifold_backend_sqlx::{Error, PostgresConfig};
use manifold_core::blobs::BlobRepository;
use manifold_core::manifests::{ManifestReferenceRepository, ManifestRepository};
use manifold_core::registries::{NewRegistry, Registry, RegistryRepository};
use manifold_core::tags::{NewTag, TagRepository};
use manifold_core::Error as CoreError;
use uuid::Uuid;

use common::*;

async fn postgres() -> Option<MetadataPool> {
    let url = match std::env::var("MANIFOLD_TEST_POSTGRES_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("MANIFOLD_TEST_POSTGRES_URL not set, skipping");
            return None;
        }
    };
    let pool = PostgresConfig {
        connection_string: url,
        max_connections: Some(16),
    }
    .new_metadata()
    .await
    .unwrap();
    pool.migrate().await.unwrap();
    Some(pool)
}

// tests share one database, so every registry gets a unique name
async fn fresh_registry(pool: &MetadataPool) -> Registry {
    let mut conn = pool.conn(None).await.unwrap();
    conn.create_registry(&NewRegistry {
        parent_id: None,
        name: format!("tenant-{}", Uuid::new_v4()),
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn concurrent_blob_pushes_converge() {
    let Some(pool) = postgres().await else { return };
    assert!(pool.capabilities().row_locks);
    let registry = fresh_registry(&pool).await;
    let blob = new_blob(registry.root_parent_id, digest('a'), 100);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let pool = pool.clone();
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
    let id = outcomes[0].get().id;
    assert!(outcomes.iter().all(|o| o.get().id == id));
}

#[tokio::test]
async fn deferred_child_and_tag_moves() {
    let Some(pool) = postgres().await else { return };
    let registry = fresh_registry(&pool).await;
    let mut conn = pool.conn(None).await.unwrap();

    let index = conn
        .create_manifest(&new_index(registry.id, "app", digest('1')))
        .await
        .unwrap();
    let err = conn
        .associate_manifest(registry.id, index.id, index.id)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ManifestSelfReference(_)));

    let child = conn
        .create_manifest(&new_manifest(registry.id, "app", digest('2')))
        .await
        .unwrap();
    conn.associate_manifest(registry.id, index.id, child.id)
        .await
        .unwrap();
    let err = conn
        .delete_manifest_by_id(registry.id, child.id)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ContentReferenced));

    let tag = |manifest_id| NewTag {
        registry_id: registry.id,
        image_name: "app".to_string(),
        name: "latest".to_string(),
        manifest_id,
    };
    assert!(conn.create_or_update_tag(&tag(index.id)).await.unwrap());
    assert!(!conn.create_or_update_tag(&tag(index.id)).await.unwrap());
    assert!(conn.create_or_update_tag(&tag(child.id)).await.unwrap());

    let mut tx = pool.begin(write_opts()).await.unwrap();
    assert!(tx
        .lock_tag_by_name_for_update(registry.id, "latest")
        .await
        .unwrap());
    tx.compare_and_swap_tag(registry.id, "app", "latest", child.id, index.id)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(
        conn.find_tag(registry.id, "app", "latest")
            .await
            .unwrap()
            .manifest_id,
        index.id
    );
}
