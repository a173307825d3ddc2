mod common;

use manifold_core::manifests::{Manifest, ManifestRepository};
use manifold_core::tags::{NewTag, TagPage, TagRepository};
use manifold_core::{Error as CoreError, ManifestId, RegistryId};
use rstest::rstest;

use common::*;

fn new_tag(manifest: &Manifest, name: &str) -> NewTag {
    NewTag {
        registry_id: manifest.registry_id,
        image_name: manifest.image_name.clone(),
        name: name.to_string(),
        manifest_id: manifest.id,
    }
}

async fn two_manifests(db: &TestDb) -> (RegistryId, Manifest, Manifest) {
    let registry = root_registry(&db.pool, "tenant").await;
    let mut conn = db.pool.conn(None).await.unwrap();
    let first = conn
        .create_manifest(&new_manifest(registry.id, "app", digest('1')))
        .await
        .unwrap();
    let second = conn
        .create_manifest(&new_manifest(registry.id, "app", digest('2')))
        .await
        .unwrap();
    (registry.id, first, second)
}

#[tokio::test]
async fn upsert_only_writes_when_the_pointer_moves() {
    let db = sqlite().await;
    let (registry_id, first, second) = two_manifests(&db).await;
    let mut conn = db.pool.conn(None).await.unwrap();

    assert!(conn.create_or_update_tag(&new_tag(&first, "latest")).await.unwrap());
    let created = conn.find_tag(registry_id, "app", "latest").await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    assert!(!conn.create_or_update_tag(&new_tag(&first, "latest")).await.unwrap());
    let unchanged = conn.find_tag(registry_id, "app", "latest").await.unwrap();
    assert_eq!(unchanged, created);

    assert!(conn.create_or_update_tag(&new_tag(&second, "latest")).await.unwrap());
    let moved = conn.find_tag(registry_id, "app", "latest").await.unwrap();
    assert_eq!(moved.id, created.id);
    assert_eq!(moved.manifest_id, second.id);
    assert_eq!(moved.created_at, created.created_at);
    assert!(moved.updated_at > created.updated_at);
}

#[rstest]
#[case::empty("")]
#[case::leading_dot(".hidden")]
#[case::slash("a/b")]
#[case::leading_dash("-rc1")]
#[tokio::test]
async fn invalid_names_are_rejected(#[case] name: &str) {
    let db = sqlite().await;
    let (_, first, _) = two_manifests(&db).await;
    let mut conn = db.pool.conn(None).await.unwrap();

    let err = conn
        .create_or_update_tag(&new_tag(&first, name))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidInput(_)));
}

#[tokio::test]
async fn tag_on_missing_manifest_is_not_found() {
    let db = sqlite().await;
    let (_, first, _) = two_manifests(&db).await;
    let mut conn = db.pool.conn(None).await.unwrap();

    let mut tag = new_tag(&first, "latest");
    tag.manifest_id = ManifestId::new(9_999);
    let err = conn.create_or_update_tag(&tag).await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound("manifest")));
}

#[tokio::test]
async fn tags_resolve_to_manifests_and_payloads() {
    let db = sqlite().await;
    let (registry_id, first, _) = two_manifests(&db).await;
    let mut conn = db.pool.conn(None).await.unwrap();
    conn.create_or_update_tag(&new_tag(&first, "v1")).await.unwrap();

    assert_eq!(
        conn.find_manifest_by_tag_name(registry_id, "app", "v1")
            .await
            .unwrap(),
        first
    );
    assert_eq!(
        conn.find_manifest_payload_by_tag_name(registry_id, "app", "v1")
            .await
            .unwrap(),
        first.payload
    );
    assert!(conn
        .find_manifest_by_tag_name(registry_id, "other", "v1")
        .await
        .unwrap_err()
        .is_not_found());
    assert_eq!(
        conn.get_tags_by_manifest_id(first.id).await.unwrap(),
        vec!["v1".to_string()]
    );
}

#[tokio::test]
async fn pagination_is_lexicographic_after_the_marker() {
    let db = sqlite().await;
    let (registry_id, first, _) = two_manifests(&db).await;
    let mut conn = db.pool.conn(None).await.unwrap();
    for name in ["v2", "latest", "v10", "beta", "v1"] {
        conn.create_or_update_tag(&new_tag(&first, name)).await.unwrap();
    }

    let names = |tags: Vec<manifold_core::tags::Tag>| {
        tags.into_iter().map(|t| t.name).collect::<Vec<_>>()
    };

    let page = conn
        .tags_paginated(registry_id, "app", &TagPage::first(2))
        .await
        .unwrap();
    assert_eq!(names(page), vec!["beta", "latest"]);
    assert!(conn.has_tags_after(registry_id, "app", "latest").await.unwrap());

    let page = conn
        .tags_paginated(registry_id, "app", &TagPage::after("latest", 10))
        .await
        .unwrap();
    assert_eq!(names(page), vec!["v1", "v10", "v2"]);
    assert!(!conn.has_tags_after(registry_id, "app", "v2").await.unwrap());

    assert!(conn
        .tags_paginated(registry_id, "app", &TagPage::first(0))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn compare_and_swap_detects_a_moved_tag() {
    let db = sqlite().await;
    let (registry_id, first, second) = two_manifests(&db).await;
    let mut conn = db.pool.conn(None).await.unwrap();
    conn.create_or_update_tag(&new_tag(&first, "latest")).await.unwrap();

    conn.compare_and_swap_tag(registry_id, "app", "latest", first.id, second.id)
        .await
        .unwrap();
    let err = conn
        .compare_and_swap_tag(registry_id, "app", "latest", first.id, second.id)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::VersionConflict("tag")));

    let err = conn
        .compare_and_swap_tag(registry_id, "app", "missing", first.id, second.id)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound("tag")));
}

#[tokio::test]
async fn lock_reports_whether_the_tag_exists() {
    let db = sqlite().await;
    let (registry_id, first, _) = two_manifests(&db).await;
    db.pool
        .conn(None)
        .await
        .unwrap()
        .create_or_update_tag(&new_tag(&first, "latest"))
        .await
        .unwrap();

    let mut tx = db.pool.begin(write_opts()).await.unwrap();
    assert!(tx.lock_tag_by_name_for_update(registry_id, "latest").await.unwrap());
    assert!(!tx.lock_tag_by_name_for_update(registry_id, "nightly").await.unwrap());
    tx.commit().await.unwrap();
}

#[tokio::test]
async fn delete_variants_report_whether_anything_went() {
    let db = sqlite().await;
    let (registry_id, first, second) = two_manifests(&db).await;
    let mut conn = db.pool.conn(None).await.unwrap();
    let other = conn
        .create_manifest(&new_manifest(registry_id, "other", digest('3')))
        .await
        .unwrap();
    conn.create_or_update_tag(&new_tag(&first, "a")).await.unwrap();
    conn.create_or_update_tag(&new_tag(&first, "b")).await.unwrap();
    conn.create_or_update_tag(&new_tag(&second, "c")).await.unwrap();
    conn.create_or_update_tag(&new_tag(&other, "c")).await.unwrap();

    assert!(conn.delete_tag(registry_id, "app", "a").await.unwrap());
    assert!(!conn.delete_tag(registry_id, "app", "a").await.unwrap());

    assert!(conn.delete_tag_by_manifest_id(registry_id, first.id).await.unwrap());
    assert!(!conn.delete_tag_by_manifest_id(registry_id, first.id).await.unwrap());

    // by name spans every image of the registry
    assert!(conn.delete_tag_by_name(registry_id, "c").await.unwrap());
    assert!(conn.find_tag(registry_id, "other", "c").await.unwrap_err().is_not_found());

    conn.create_or_update_tag(&new_tag(&second, "d")).await.unwrap();
    assert!(conn.delete_tags_by_image_name(registry_id, "app").await.unwrap());
    assert!(!conn.delete_tags_by_image_name(registry_id, "app").await.unwrap());
}
