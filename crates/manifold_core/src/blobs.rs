use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::ids::{BlobId, MediaTypeId, PrincipalId, RegistryId};
use crate::oci_digest::OciDigest;
use crate::outcome::CreateOrFind;

/// Content-addressed blob metadata. A digest is stored at most once per tenant tree
/// (`root_parent_id`), no matter how many images reference it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    pub id: BlobId,
    pub root_parent_id: RegistryId,
    pub digest: OciDigest,
    pub media_type_id: MediaTypeId,
    pub media_type: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<PrincipalId>,
}

#[derive(Clone, Debug)]
pub struct NewBlob {
    pub root_parent_id: RegistryId,
    pub digest: OciDigest,
    pub media_type: String,
    pub size: i64,
}

/// Provides access to blob metadata.
#[async_trait]
pub trait BlobRepository: Send {
    async fn find_blob_by_id(&mut self, id: BlobId) -> Result<Blob>;

    async fn find_blob_by_digest_and_root_parent_id(
        &mut self,
        digest: &OciDigest,
        root_parent_id: RegistryId,
    ) -> Result<Blob>;

    /// Find a blob through its link to an image within a registry.
    async fn find_blob_by_digest_and_repo_id(
        &mut self,
        digest: &OciDigest,
        registry_id: RegistryId,
        image_name: &str,
    ) -> Result<Blob>;

    /// Insert a blob, or return the row that already holds its digest in the same tenant tree.
    /// Concurrent callers pushing identical content converge on one row.
    async fn create_or_find_blob(&mut self, blob: &NewBlob) -> Result<CreateOrFind<Blob>>;

    /// Fails with [`crate::Error::ContentReferenced`] while a layer, config or link still points
    /// at the blob.
    async fn delete_blob_by_id(&mut self, id: BlobId) -> Result<()>;

    async fn exists_blob(
        &mut self,
        registry_id: RegistryId,
        digest: &OciDigest,
        image_name: &str,
    ) -> Result<bool>;

    /// Sum of blob sizes in a tenant tree; zero when it holds no blobs.
    async fn total_size_by_root_parent_id(&mut self, root_parent_id: RegistryId) -> Result<i64>;
}

/// Links between blobs and the images that uploaded them.
#[async_trait]
pub trait RegistryBlobRepository: Send {
    /// Returns false when the link already existed.
    async fn link_blob(
        &mut self,
        registry_id: RegistryId,
        blob_id: BlobId,
        image_name: &str,
    ) -> Result<bool>;

    async fn unlink_blob(
        &mut self,
        registry_id: RegistryId,
        blob_id: BlobId,
        image_name: &str,
    ) -> Result<bool>;

    async fn unlink_blobs_by_image_name(
        &mut self,
        registry_id: RegistryId,
        image_name: &str,
    ) -> Result<u64>;
}
