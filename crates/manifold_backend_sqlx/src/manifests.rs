//! Registry-level manifest writes built from the repository primitives.
use manifold_core::blobs::{Blob, BlobRepository};
use manifold_core::manifests::{
    LayerRepository, Manifest, ManifestConfiguration, ManifestReferenceRepository,
    ManifestRepository, NewManifest, OciImageIndexMappingRepository,
};
use manifold_core::registries::RegistryRepository;
use manifold_core::tags::{NewTag, TagRepository};
use manifold_core::{
    validate_tag_name, DescriptorInfo, Error as CoreError, ManifestRef, ManifestSpec, OciDigest,
    PrincipalId, RegistryId,
};

use super::errors::Result;
use super::metadata::{MetadataPool, MetadataTx, TxOptions};

/// Outcome of [`ManifestWriter::put`].
#[derive(Clone, Debug)]
pub struct PushedManifest {
    pub manifest: Manifest,
    /// False when the same digest had already been pushed to this image.
    pub created: bool,
    /// Whether the tag named by the push now points somewhere new.
    pub tag_moved: bool,
    /// Index children that are not in the image yet, recorded for later resolution.
    pub pending_children: Vec<OciDigest>,
}

/// Writes manifests for one image of one registry.
#[derive(Clone, Debug)]
pub struct ManifestWriter {
    metadata: MetadataPool,
    registry_id: RegistryId,
    image_name: String,
    principal: Option<PrincipalId>,
}

struct PushRequest {
    registry_id: RegistryId,
    image_name: String,
    digest: OciDigest,
    tag: Option<String>,
    spec: ManifestSpec,
    total_size: i64,
    payload: Vec<u8>,
}

impl ManifestWriter {
    pub fn new(metadata: MetadataPool, registry_id: RegistryId, image_name: impl Into<String>) -> Self {
        Self {
            metadata,
            registry_id,
            image_name: image_name.into(),
            principal: None,
        }
    }

    /// Stamp rows written through this writer with `principal`.
    pub fn with_principal(mut self, principal: PrincipalId) -> Self {
        self.principal = Some(principal);
        self
    }

    fn tx_options(&self) -> TxOptions {
        match self.principal {
            Some(principal) => TxOptions::read_write().principal(principal),
            None => TxOptions::read_write(),
        }
    }

    /// Record a pushed manifest and everything it points at in one transaction.
    ///
    /// Config and layer blobs must already be stored in the tenant; a missing one fails the push
    /// with [`CoreError::BlobUnknown`]. Index children that have not been pushed yet are recorded
    /// as index mappings and linked once they arrive.
    #[tracing::instrument(skip(self, payload), fields(registry_id = %self.registry_id, image = %self.image_name))]
    pub async fn put(&self, reference: &ManifestRef, payload: Vec<u8>) -> Result<PushedManifest> {
        let (digest, tag) = match reference {
            ManifestRef::Digest(expected) => {
                let calculated = OciDigest::from_content_with(expected.algorithm(), &payload)?;
                if &calculated != expected {
                    return Err(CoreError::InvalidDigest(format!(
                        "payload hashes to {calculated}, not {expected}"
                    ))
                    .into());
                }
                (calculated, None)
            }
            ManifestRef::Tag(tag) => {
                validate_tag_name(tag)?;
                (OciDigest::from_content(&payload), Some(tag.clone()))
            }
        };
        let spec = ManifestSpec::try_from(payload.as_slice())?;
        let total_size = spec.total_size(payload.len())?;

        let request = PushRequest {
            registry_id: self.registry_id,
            image_name: self.image_name.clone(),
            digest,
            tag,
            spec,
            total_size,
            payload,
        };
        let pushed = self
            .metadata
            .with_tx(self.tx_options(), move |tx| Box::pin(push(tx, request)))
            .await?;

        tracing::debug!(
            digest = %pushed.manifest.digest,
            created = pushed.created,
            pending_children = pushed.pending_children.len(),
            "manifest recorded"
        );
        Ok(pushed)
    }

    /// Delete a manifest by digest. Refuses with [`CoreError::ContentReferenced`] while an index
    /// manifest still lists it as a child.
    #[tracing::instrument(skip(self), fields(registry_id = %self.registry_id, image = %self.image_name))]
    pub async fn delete_manifest(&self, digest: &OciDigest) -> Result<Manifest> {
        let registry_id = self.registry_id;
        let image_name = self.image_name.clone();
        let digest = digest.clone();
        self.metadata
            .with_tx(self.tx_options(), move |tx| {
                Box::pin(delete_unreferenced(tx, registry_id, image_name, digest))
            })
            .await
    }

    /// Remove a tag without touching the manifest it points at.
    pub async fn delete_tag(&self, tag: &str) -> Result<bool> {
        validate_tag_name(tag)?;
        let mut conn = self.metadata.conn(self.principal).await?;
        Ok(conn
            .delete_tag(self.registry_id, &self.image_name, tag)
            .await?)
    }
}

async fn find_blob(tx: &mut MetadataTx, root_parent_id: RegistryId, desc: &DescriptorInfo) -> Result<Blob> {
    match tx
        .find_blob_by_digest_and_root_parent_id(&desc.digest, root_parent_id)
        .await
    {
        Ok(blob) => Ok(blob),
        Err(e) if e.is_not_found() => {
            tracing::warn!(digest = %desc.digest, "blob referenced by manifest not found");
            Err(CoreError::BlobUnknown(desc.digest.to_string()).into())
        }
        Err(e) => Err(e.into()),
    }
}

async fn push(tx: &mut MetadataTx, req: PushRequest) -> Result<PushedManifest> {
    let registry = tx.find_registry(req.registry_id).await?;
    let spec = &req.spec;

    let configuration = match spec.config()? {
        Some(desc) => {
            let blob = find_blob(tx, registry.root_parent_id, &desc).await?;
            Some(ManifestConfiguration {
                blob_id: blob.id,
                media_type: desc.media_type,
                digest: desc.digest,
                payload: None,
            })
        }
        None => None,
    };

    let layer_descs = spec.layers()?;
    let mut layers = Vec::with_capacity(layer_descs.len());
    for desc in &layer_descs {
        layers.push(find_blob(tx, registry.root_parent_id, desc).await?);
    }

    let children = spec.children()?;
    let subject = spec.subject()?;
    let subject_id = match &subject {
        Some(s) => match tx
            .find_manifest_by_digest(req.registry_id, &req.image_name, &s.digest)
            .await
        {
            Ok(m) => Some(m.id),
            // referrers may be pushed before their subject
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        },
        None => None,
    };

    let new_manifest = NewManifest {
        registry_id: req.registry_id,
        image_name: req.image_name.clone(),
        digest: req.digest.clone(),
        schema_version: spec.schema_version(),
        media_type: spec.resolved_media_type()?,
        artifact_media_type: spec.artifact_type(),
        total_size: req.total_size,
        payload: req.payload.clone(),
        configuration,
        subject_id,
        subject_digest: subject.map(|s| s.digest),
        non_conformant: false,
        non_distributable_layers: spec.has_non_distributable_layers()?,
        annotations: spec.annotations(),
    };

    let outcome = tx.create_or_find_manifest(&new_manifest).await?;
    let created = outcome.is_created();
    let manifest = outcome.into_inner();

    let mut pending_children = Vec::new();
    if created {
        for blob in &layers {
            tx.associate_layer_blob(&manifest, blob).await?;
        }

        for child in &children {
            if link_child(tx, &manifest, &child.digest).await? {
                continue;
            }
            tx.create_index_mapping(manifest.id, &child.digest).await?;
            pending_children.push(child.digest.clone());
        }

        // indexes pushed earlier may be waiting on this digest
        let waiting = tx
            .get_all_index_mappings_by_child_digest(req.registry_id, &req.image_name, &manifest.digest)
            .await?;
        for mapping in waiting {
            tx.associate_manifest(req.registry_id, mapping.parent_manifest_id, manifest.id)
                .await?;
            tracing::debug!(
                parent_id = %mapping.parent_manifest_id,
                child_id = %manifest.id,
                "resolved deferred index child"
            );
        }
    }

    let tag_moved = match &req.tag {
        Some(name) => {
            tx.lock_tag_by_name_for_update(req.registry_id, name).await?;
            tx.create_or_update_tag(&NewTag {
                registry_id: req.registry_id,
                image_name: req.image_name.clone(),
                name: name.clone(),
                manifest_id: manifest.id,
            })
            .await?
        }
        None => false,
    };

    Ok(PushedManifest {
        manifest,
        created,
        tag_moved,
        pending_children,
    })
}

async fn delete_unreferenced(
    tx: &mut MetadataTx,
    registry_id: RegistryId,
    image_name: String,
    digest: OciDigest,
) -> Result<Manifest> {
    let manifest = tx
        .find_manifest_by_digest(registry_id, &image_name, &digest)
        .await?;
    let parents = tx.find_parent_manifest_ids(registry_id, manifest.id).await?;
    if !parents.is_empty() {
        tracing::warn!(
            manifest_id = %manifest.id,
            parents = parents.len(),
            "refusing to delete manifest listed by an index"
        );
        return Err(CoreError::ContentReferenced.into());
    }
    tx.delete_tag_by_manifest_id(registry_id, manifest.id).await?;
    tx.delete_manifest_by_id(registry_id, manifest.id).await?;
    Ok(manifest)
}

// Returns false when the child has not been pushed yet.
async fn link_child(tx: &mut MetadataTx, parent: &Manifest, digest: &OciDigest) -> Result<bool> {
    let child = match tx
        .find_manifest_by_digest(parent.registry_id, &parent.image_name, digest)
        .await
    {
        Ok(child) => child,
        Err(e) if e.is_not_found() => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    match tx
        .associate_manifest(parent.registry_id, parent.id, child.id)
        .await
    {
        Ok(()) => Ok(true),
        Err(CoreError::ReferencedManifestNotFound) => Ok(false),
        Err(e) => Err(e.into()),
    }
}
