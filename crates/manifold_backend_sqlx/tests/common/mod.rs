#![allow(dead_code)]
use std::collections::BTreeMap;

use tempfile::TempDir;

use manifold_backend_sqlx::metadata::{MetadataPool, TxOptions};
use manifold_backend_sqlx::SqliteConfig;
use manifold_core::blobs::NewBlob;
use manifold_core::manifests::NewManifest;
use manifold_core::registries::{NewRegistry, Registry, RegistryRepository};
use manifold_core::{OciDigest, RegistryId};

pub const IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const IMAGE_LAYER: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// A migrated SQLite database that lives as long as the value.
pub struct TestDb {
    pub pool: MetadataPool,
    _dir: TempDir,
}

pub async fn sqlite() -> TestDb {
    let dir = tempfile::tempdir().unwrap();
    let pool = SqliteConfig::new(dir.path().join("metadata.db"))
        .new_metadata()
        .await
        .unwrap();
    pool.migrate().await.unwrap();
    TestDb { pool, _dir: dir }
}

pub async fn root_registry(pool: &MetadataPool, name: &str) -> Registry {
    let mut conn = pool.conn(None).await.unwrap();
    conn.create_registry(&NewRegistry {
        parent_id: None,
        name: name.to_string(),
    })
    .await
    .unwrap()
}

/// A well-formed sha256 digest made of one repeated hex character.
pub fn digest(c: char) -> OciDigest {
    OciDigest::try_from(format!("sha256:{}", c.to_string().repeat(64))).unwrap()
}

pub fn new_blob(root_parent_id: RegistryId, digest: OciDigest, size: i64) -> NewBlob {
    NewBlob {
        root_parent_id,
        digest,
        media_type: IMAGE_LAYER.to_string(),
        size,
    }
}

pub fn new_manifest(registry_id: RegistryId, image_name: &str, digest: OciDigest) -> NewManifest {
    NewManifest {
        registry_id,
        image_name: image_name.to_string(),
        digest,
        schema_version: 2,
        media_type: IMAGE_MANIFEST.to_string(),
        artifact_media_type: None,
        total_size: 0,
        payload: b"{}".to_vec(),
        configuration: None,
        subject_id: None,
        subject_digest: None,
        non_conformant: false,
        non_distributable_layers: false,
        annotations: BTreeMap::new(),
    }
}

pub fn new_index(registry_id: RegistryId, image_name: &str, digest: OciDigest) -> NewManifest {
    NewManifest {
        media_type: IMAGE_INDEX.to_string(),
        ..new_manifest(registry_id, image_name, digest)
    }
}

pub fn write_opts() -> TxOptions {
    TxOptions::read_write()
}
