//! Manifests, the reference graph between indexes and their children, and layer links.
use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::blobs::Blob;
use crate::errors::Result;
use crate::ids::{
    BlobId, IndexMappingId, LayerId, ManifestId, ManifestReferenceId, MediaTypeId, PrincipalId,
    RegistryId,
};
use crate::oci_digest::OciDigest;
use crate::outcome::CreateOrFind;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Manifest {
    pub id: ManifestId,
    pub registry_id: RegistryId,
    pub image_name: String,
    pub digest: OciDigest,
    pub schema_version: i32,
    pub media_type_id: MediaTypeId,
    pub media_type: String,
    pub artifact_media_type: Option<String>,
    pub total_size: i64,
    pub payload: Vec<u8>,
    pub configuration: Option<ManifestConfiguration>,
    pub subject_id: Option<ManifestId>,
    pub subject_digest: Option<OciDigest>,
    pub non_conformant: bool,
    pub non_distributable_layers: bool,
    pub annotations: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<PrincipalId>,
    pub updated_by: Option<PrincipalId>,
}

/// The config blob of an image manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestConfiguration {
    pub blob_id: BlobId,
    pub media_type: String,
    pub digest: OciDigest,
    pub payload: Option<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct NewManifest {
    pub registry_id: RegistryId,
    pub image_name: String,
    pub digest: OciDigest,
    pub schema_version: i32,
    pub media_type: String,
    pub artifact_media_type: Option<String>,
    pub total_size: i64,
    pub payload: Vec<u8>,
    pub configuration: Option<ManifestConfiguration>,
    pub subject_id: Option<ManifestId>,
    pub subject_digest: Option<OciDigest>,
    pub non_conformant: bool,
    pub non_distributable_layers: bool,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestReference {
    pub id: ManifestReferenceId,
    pub registry_id: RegistryId,
    pub parent_id: ManifestId,
    pub child_id: ManifestId,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<PrincipalId>,
}

/// An index's claim on a child digest that has not been pushed yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OciImageIndexMapping {
    pub id: IndexMappingId,
    pub parent_manifest_id: ManifestId,
    pub child_digest: OciDigest,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<PrincipalId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layer {
    pub id: LayerId,
    pub registry_id: RegistryId,
    pub manifest_id: ManifestId,
    pub media_type_id: MediaTypeId,
    pub blob_id: BlobId,
    pub size: i64,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<PrincipalId>,
}

/// Provides access to manifest metadata.
#[async_trait]
pub trait ManifestRepository: Send {
    /// Plain insert for callers that already hold uniqueness, e.g. under a lock. A collision is
    /// reported as [`crate::Error::Duplicate`].
    async fn create_manifest(&mut self, manifest: &NewManifest) -> Result<Manifest>;

    /// Insert, or return the manifest already stored under the same registry, image and digest.
    async fn create_or_find_manifest(
        &mut self,
        manifest: &NewManifest,
    ) -> Result<CreateOrFind<Manifest>>;

    async fn get_manifest(&mut self, id: ManifestId) -> Result<Manifest>;

    async fn find_manifest_by_id(
        &mut self,
        registry_id: RegistryId,
        id: ManifestId,
    ) -> Result<Manifest>;

    async fn find_manifest_by_digest(
        &mut self,
        registry_id: RegistryId,
        image_name: &str,
        digest: &OciDigest,
    ) -> Result<Manifest>;

    async fn find_manifest_by_tag_name(
        &mut self,
        registry_id: RegistryId,
        image_name: &str,
        tag: &str,
    ) -> Result<Manifest>;

    async fn get_manifest_payload(
        &mut self,
        registry_id: RegistryId,
        image_name: &str,
        digest: &OciDigest,
    ) -> Result<Vec<u8>>;

    async fn find_manifest_payload_by_tag_name(
        &mut self,
        registry_id: RegistryId,
        image_name: &str,
        tag: &str,
    ) -> Result<Vec<u8>>;

    /// Manifests directly referenced as children of `manifest`.
    async fn references(&mut self, manifest: &Manifest) -> Result<Vec<Manifest>>;

    /// Blobs associated with `manifest` as layers.
    async fn layer_blobs(&mut self, manifest: &Manifest) -> Result<Vec<Blob>>;

    /// Referrers: manifests whose subject is `subject_id`.
    async fn list_manifests_by_subject(
        &mut self,
        registry_id: RegistryId,
        subject_id: ManifestId,
    ) -> Result<Vec<Manifest>>;

    /// Referrers by subject digest, including ones pushed before their subject.
    async fn list_manifests_by_subject_digest(
        &mut self,
        registry_id: RegistryId,
        digest: &OciDigest,
    ) -> Result<Vec<Manifest>>;

    async fn count_manifests_by_image_name(
        &mut self,
        registry_id: RegistryId,
        image_name: &str,
    ) -> Result<i64>;

    /// Replace the annotations of a manifest last updated at `expected_updated_at`. A concurrent
    /// update in between yields [`crate::Error::VersionConflict`].
    async fn update_manifest_annotations(
        &mut self,
        registry_id: RegistryId,
        id: ManifestId,
        expected_updated_at: DateTime<Utc>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Manifest>;

    /// Hard delete. Does not look for index manifests that still list this one as a child;
    /// the schema rejects the delete with [`crate::Error::ContentReferenced`] in that case.
    async fn delete_manifest(
        &mut self,
        registry_id: RegistryId,
        image_name: &str,
        digest: &OciDigest,
    ) -> Result<bool>;

    async fn delete_manifest_by_id(&mut self, registry_id: RegistryId, id: ManifestId)
        -> Result<bool>;

    async fn delete_manifest_by_image_name(
        &mut self,
        registry_id: RegistryId,
        image_name: &str,
    ) -> Result<bool>;
}

/// Edges between index manifests and their children.
#[async_trait]
pub trait ManifestReferenceRepository: Send {
    /// Idempotent. Rejects `parent_id == child_id` before touching storage and reports a missing
    /// child as [`crate::Error::ReferencedManifestNotFound`].
    async fn associate_manifest(
        &mut self,
        registry_id: RegistryId,
        parent_id: ManifestId,
        child_id: ManifestId,
    ) -> Result<()>;

    async fn dissociate_manifest(
        &mut self,
        registry_id: RegistryId,
        parent_id: ManifestId,
        child_id: ManifestId,
    ) -> Result<bool>;

    async fn list_manifest_references(
        &mut self,
        registry_id: RegistryId,
        parent_id: ManifestId,
    ) -> Result<Vec<ManifestReference>>;

    /// Parents holding an edge to `child_id`.
    async fn find_parent_manifest_ids(
        &mut self,
        registry_id: RegistryId,
        child_id: ManifestId,
    ) -> Result<Vec<ManifestId>>;
}

#[async_trait]
pub trait OciImageIndexMappingRepository: Send {
    /// Returns false when the mapping already existed.
    async fn create_index_mapping(
        &mut self,
        parent_manifest_id: ManifestId,
        child_digest: &OciDigest,
    ) -> Result<bool>;

    /// Index manifests of an image that are waiting for `child_digest`.
    async fn get_all_index_mappings_by_child_digest(
        &mut self,
        registry_id: RegistryId,
        image_name: &str,
        child_digest: &OciDigest,
    ) -> Result<Vec<OciImageIndexMapping>>;
}

#[async_trait]
pub trait LayerRepository: Send {
    /// Idempotent. A manifest that does not exist is reported as
    /// [`crate::Error::ReferencedManifestNotFound`].
    async fn associate_layer_blob(&mut self, manifest: &Manifest, blob: &Blob) -> Result<()>;

    async fn dissociate_layer_blob(&mut self, manifest: &Manifest, blob: &Blob) -> Result<bool>;

    async fn get_all_layers_by_manifest_id(&mut self, manifest_id: ManifestId)
        -> Result<Vec<Layer>>;
}
