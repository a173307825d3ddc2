mod common;

use manifold_backend_sqlx::{Error, ManifestWriter};
use manifold_core::blobs::{Blob, BlobRepository, NewBlob};
use manifold_core::manifests::{ManifestConfiguration, ManifestReferenceRepository, ManifestRepository};
use manifold_core::registries::Registry;
use manifold_core::tags::{NewTag, TagRepository};
use manifold_core::{BlobId, Error as CoreError, ManifestId, ManifestRef, OciDigest, PrincipalId};

use common::*;

#[tokio::test]
async fn blob_manifest_and_tag_lifecycle() {
    let db = sqlite().await;
    let registry = root_registry(&db.pool, "tenant").await;
    let mut conn = db.pool.conn(None).await.unwrap();

    let blob = new_blob(registry.root_parent_id, digest('a'), 100);
    let first = conn.create_or_find_blob(&blob).await.unwrap();
    assert!(first.is_created());
    assert_eq!(first.get().id, BlobId::new(1));
    let again = conn.create_or_find_blob(&blob).await.unwrap();
    assert!(!again.is_created());
    assert_eq!(again.get().id, BlobId::new(1));
    assert_eq!(
        conn.total_size_by_root_parent_id(registry.root_parent_id)
            .await
            .unwrap(),
        100
    );

    let config = first.into_inner();
    let mut manifest = new_manifest(registry.id, "app", digest('b'));
    manifest.configuration = Some(ManifestConfiguration {
        blob_id: config.id,
        media_type: IMAGE_CONFIG.to_string(),
        digest: config.digest.clone(),
        payload: None,
    });
    let bbb = conn.create_manifest(&manifest).await.unwrap();
    assert_eq!(bbb.id, ManifestId::new(1));

    let latest = |manifest_id| NewTag {
        registry_id: registry.id,
        image_name: "app".to_string(),
        name: "latest".to_string(),
        manifest_id,
    };
    assert!(conn.create_or_update_tag(&latest(bbb.id)).await.unwrap());
    assert_eq!(
        conn.find_tag(registry.id, "app", "latest")
            .await
            .unwrap()
            .manifest_id,
        ManifestId::new(1)
    );

    let ccc = conn
        .create_manifest(&new_manifest(registry.id, "app", digest('c')))
        .await
        .unwrap();
    assert!(conn.create_or_update_tag(&latest(ccc.id)).await.unwrap());
    assert_eq!(
        conn.find_tag(registry.id, "app", "latest")
            .await
            .unwrap()
            .manifest_id,
        ccc.id
    );
}

async fn store_blob(db: &TestDb, registry: &Registry, content: &[u8], media_type: &str) -> Blob {
    let mut conn = db.pool.conn(None).await.unwrap();
    conn.create_or_find_blob(&NewBlob {
        root_parent_id: registry.root_parent_id,
        digest: OciDigest::from_content(content),
        media_type: media_type.to_string(),
        size: content.len() as i64,
    })
    .await
    .unwrap()
    .into_inner()
}

fn image_payload(config: &Blob, layer: &Blob) -> Vec<u8> {
    format!(
        r#"{{
            "schemaVersion": 2,
            "mediaType": "{IMAGE_MANIFEST}",
            "config": {{ "mediaType": "{IMAGE_CONFIG}", "digest": "{}", "size": {} }},
            "layers": [ {{ "mediaType": "{IMAGE_LAYER}", "digest": "{}", "size": {} }} ],
            "annotations": {{ "org.opencontainers.image.title": "app" }}
        }}"#,
        config.digest, config.size, layer.digest, layer.size
    )
    .into_bytes()
}

fn index_payload(child: &OciDigest, child_size: usize) -> Vec<u8> {
    format!(
        r#"{{
            "schemaVersion": 2,
            "mediaType": "{IMAGE_INDEX}",
            "manifests": [ {{ "mediaType": "{IMAGE_MANIFEST}", "digest": "{child}", "size": {child_size} }} ]
        }}"#
    )
    .into_bytes()
}

#[tokio::test]
async fn index_pushed_ahead_of_its_image() {
    let db = sqlite().await;
    let registry = root_registry(&db.pool, "tenant").await;
    let config = store_blob(&db, &registry, b"{}", IMAGE_CONFIG).await;
    let layer = store_blob(&db, &registry, b"layer bytes", IMAGE_LAYER).await;
    let writer = ManifestWriter::new(db.pool.clone(), registry.id, "app")
        .with_principal(PrincipalId::new(3));

    let image = image_payload(&config, &layer);
    let image_digest = OciDigest::from_content(&image);
    let index = index_payload(&image_digest, image.len());

    let pushed_index = writer
        .put(&ManifestRef::Tag("latest".to_string()), index.clone())
        .await
        .unwrap();
    assert!(pushed_index.created);
    assert!(pushed_index.tag_moved);
    assert_eq!(pushed_index.pending_children, vec![image_digest.clone()]);
    assert_eq!(pushed_index.manifest.media_type, IMAGE_INDEX);
    assert_eq!(pushed_index.manifest.created_by, Some(PrincipalId::new(3)));

    let pushed_image = writer
        .put(&ManifestRef::Digest(image_digest.clone()), image.clone())
        .await
        .unwrap();
    assert!(pushed_image.created);
    assert!(!pushed_image.tag_moved);
    assert!(pushed_image.pending_children.is_empty());
    assert_eq!(
        pushed_image.manifest.total_size,
        image.len() as i64 + config.size + layer.size
    );

    let mut conn = db.pool.conn(None).await.unwrap();
    assert_eq!(
        conn.references(&pushed_index.manifest).await.unwrap(),
        vec![pushed_image.manifest.clone()]
    );
    assert_eq!(
        conn.layer_blobs(&pushed_image.manifest).await.unwrap(),
        vec![layer]
    );
    assert_eq!(
        pushed_image.manifest.configuration.as_ref().map(|c| c.blob_id),
        Some(config.id)
    );

    // pushing the same bytes again changes nothing
    let repeat = writer
        .put(&ManifestRef::Digest(image_digest.clone()), image)
        .await
        .unwrap();
    assert!(!repeat.created);
    assert_eq!(repeat.manifest.id, pushed_image.manifest.id);

    let err = writer.delete_manifest(&image_digest).await.unwrap_err();
    assert!(matches!(err, Error::ManifoldError(CoreError::ContentReferenced)));

    let deleted = writer
        .delete_manifest(&pushed_index.manifest.digest)
        .await
        .unwrap();
    assert_eq!(deleted.id, pushed_index.manifest.id);
    assert!(conn
        .find_tag(registry.id, "app", "latest")
        .await
        .unwrap_err()
        .is_not_found());
    assert!(conn
        .find_parent_manifest_ids(registry.id, pushed_image.manifest.id)
        .await
        .unwrap()
        .is_empty());
    writer.delete_manifest(&image_digest).await.unwrap();
}

#[tokio::test]
async fn image_pushed_ahead_of_its_index_links_immediately() {
    let db = sqlite().await;
    let registry = root_registry(&db.pool, "tenant").await;
    let config = store_blob(&db, &registry, b"{}", IMAGE_CONFIG).await;
    let layer = store_blob(&db, &registry, b"layer bytes", IMAGE_LAYER).await;
    let writer = ManifestWriter::new(db.pool.clone(), registry.id, "app");

    let image = image_payload(&config, &layer);
    let image_digest = OciDigest::from_content(&image);
    let pushed_image = writer
        .put(&ManifestRef::Digest(image_digest.clone()), image.clone())
        .await
        .unwrap();

    let index = index_payload(&image_digest, image.len());
    let pushed_index = writer
        .put(&ManifestRef::Digest(OciDigest::from_content(&index)), index)
        .await
        .unwrap();
    assert!(pushed_index.pending_children.is_empty());

    let mut conn = db.pool.conn(None).await.unwrap();
    assert_eq!(
        conn.references(&pushed_index.manifest).await.unwrap(),
        vec![pushed_image.manifest]
    );
}

#[tokio::test]
async fn pushes_with_bad_input_write_nothing() {
    let db = sqlite().await;
    let registry = root_registry(&db.pool, "tenant").await;
    let config = store_blob(&db, &registry, b"{}", IMAGE_CONFIG).await;
    let writer = ManifestWriter::new(db.pool.clone(), registry.id, "app");

    // layer blob was never uploaded
    let missing_layer = Blob {
        digest: OciDigest::from_content(b"never uploaded"),
        ..config.clone()
    };
    let image = image_payload(&config, &missing_layer);
    let err = writer
        .put(&ManifestRef::Tag("latest".to_string()), image.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ManifoldError(CoreError::BlobUnknown(_))));

    let err = writer
        .put(&ManifestRef::Digest(digest('0')), image)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ManifoldError(CoreError::InvalidDigest(_))));

    let err = writer
        .put(&ManifestRef::Tag("latest".to_string()), b"not json".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ManifoldError(CoreError::InvalidManifest(_))));

    let layer = store_blob(&db, &registry, b"layer", IMAGE_LAYER).await;
    let oversized = Blob {
        size: i64::MAX,
        ..layer
    };
    let err = writer
        .put(
            &ManifestRef::Tag("latest".to_string()),
            image_payload(&config, &oversized),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ManifoldError(CoreError::InvalidManifest(_))));

    let mut conn = db.pool.conn(None).await.unwrap();
    assert_eq!(
        conn.count_manifests_by_image_name(registry.id, "app")
            .await
            .unwrap(),
        0
    );
    assert!(!writer.delete_tag("latest").await.unwrap());
}
