use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Expr, Func, InsertStatement, OnConflict, Order, Query, SelectStatement};

use manifold_core::blobs::Blob;
use manifold_core::manifests::{Manifest, ManifestConfiguration, ManifestRepository, NewManifest};
use manifold_core::{
    BlobId, CreateOrFind, Error as CoreError, ManifestId, OciDigest, PrincipalId, RegistryId,
    Result as CoreResult,
};

use super::blobs::{blob_select, fetch_blobs};
use super::executor::Executor;
use super::registries::map_media_type;
use super::schema::{
    from_millis, now_millis, Blobs, Layers, ManifestReferences, Manifests, MediaTypes, Tags,
};
use super::tx::{MetadataConn, MetadataTx};
use crate::errors::{Error, Result};

#[derive(sqlx::FromRow)]
struct ManifestRow {
    id: i64,
    registry_id: i64,
    image_name: String,
    digest: Vec<u8>,
    schema_version: i32,
    media_type_id: i64,
    media_type: String,
    artifact_media_type: Option<String>,
    total_size: i64,
    payload: Vec<u8>,
    config_blob_id: Option<i64>,
    config_media_type: Option<String>,
    config_digest: Option<Vec<u8>>,
    config_payload: Option<Vec<u8>>,
    subject_id: Option<i64>,
    subject_digest: Option<Vec<u8>>,
    non_conformant: bool,
    non_distributable_layers: bool,
    annotations: Option<String>,
    created_at: i64,
    updated_at: i64,
    created_by: Option<i64>,
    updated_by: Option<i64>,
}

impl TryFrom<ManifestRow> for Manifest {
    type Error = Error;

    fn try_from(row: ManifestRow) -> Result<Self> {
        let configuration = match (row.config_blob_id, row.config_media_type, row.config_digest) {
            (Some(blob_id), Some(media_type), Some(digest)) => Some(ManifestConfiguration {
                blob_id: BlobId::new(blob_id),
                media_type,
                digest: OciDigest::from_bytes(&digest)?,
                payload: row.config_payload,
            }),
            _ => None,
        };
        let annotations = match row.annotations {
            Some(text) => serde_json::from_str(&text)?,
            None => BTreeMap::new(),
        };

        Ok(Manifest {
            id: row.id.into(),
            registry_id: row.registry_id.into(),
            image_name: row.image_name,
            digest: OciDigest::from_bytes(&row.digest)?,
            schema_version: row.schema_version,
            media_type_id: row.media_type_id.into(),
            media_type: row.media_type,
            artifact_media_type: row.artifact_media_type,
            total_size: row.total_size,
            payload: row.payload,
            configuration,
            subject_id: row.subject_id.map(ManifestId::from),
            subject_digest: row
                .subject_digest
                .as_deref()
                .map(OciDigest::from_bytes)
                .transpose()?,
            non_conformant: row.non_conformant,
            non_distributable_layers: row.non_distributable_layers,
            annotations,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            created_by: row.created_by.map(PrincipalId::from),
            updated_by: row.updated_by.map(PrincipalId::from),
        })
    }
}

fn manifest_select() -> SelectStatement {
    Query::select()
        .columns(
            [
                Manifests::Id,
                Manifests::RegistryId,
                Manifests::ImageName,
                Manifests::Digest,
                Manifests::SchemaVersion,
                Manifests::MediaTypeId,
                Manifests::ArtifactMediaType,
                Manifests::TotalSize,
                Manifests::Payload,
                Manifests::ConfigBlobId,
                Manifests::ConfigMediaType,
                Manifests::ConfigDigest,
                Manifests::ConfigPayload,
                Manifests::SubjectId,
                Manifests::SubjectDigest,
                Manifests::NonConformant,
                Manifests::NonDistributableLayers,
                Manifests::Annotations,
                Manifests::CreatedAt,
                Manifests::UpdatedAt,
                Manifests::CreatedBy,
                Manifests::UpdatedBy,
            ]
            .map(|c| (Manifests::Table, c)),
        )
        .column((MediaTypes::Table, MediaTypes::MediaType))
        .from(Manifests::Table)
        .inner_join(
            MediaTypes::Table,
            Expr::col((MediaTypes::Table, MediaTypes::Id))
                .equals((Manifests::Table, Manifests::MediaTypeId)),
        )
        .to_owned()
}

async fn fetch_manifest(ex: &mut Executor<'_>, stmt: &SelectStatement) -> Result<Manifest> {
    ex.fetch_optional::<ManifestRow, _>(stmt)
        .await?
        .ok_or(CoreError::NotFound("manifest"))?
        .try_into()
}

async fn fetch_manifests(ex: &mut Executor<'_>, stmt: &SelectStatement) -> Result<Vec<Manifest>> {
    ex.fetch_all::<ManifestRow, _>(stmt)
        .await?
        .into_iter()
        .map(Manifest::try_from)
        .collect()
}

fn annotations_text(annotations: &BTreeMap<String, String>) -> Result<Option<String>> {
    if annotations.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(annotations)?))
}

async fn insert_stmt(
    ex: &mut Executor<'_>,
    principal: Option<PrincipalId>,
    manifest: &NewManifest,
) -> Result<InsertStatement> {
    let media_type_id = map_media_type(ex, &manifest.media_type).await?;
    let config = manifest.configuration.as_ref();
    let now = now_millis();
    let principal = principal.map(PrincipalId::get);

    Ok(Query::insert()
        .into_table(Manifests::Table)
        .columns([
            Manifests::RegistryId,
            Manifests::ImageName,
            Manifests::Digest,
            Manifests::SchemaVersion,
            Manifests::MediaTypeId,
            Manifests::ArtifactMediaType,
            Manifests::TotalSize,
            Manifests::Payload,
            Manifests::ConfigBlobId,
            Manifests::ConfigMediaType,
            Manifests::ConfigDigest,
            Manifests::ConfigPayload,
            Manifests::SubjectId,
            Manifests::SubjectDigest,
            Manifests::NonConformant,
            Manifests::NonDistributableLayers,
            Manifests::Annotations,
            Manifests::CreatedAt,
            Manifests::UpdatedAt,
            Manifests::CreatedBy,
            Manifests::UpdatedBy,
        ])
        .values([
            manifest.registry_id.get().into(),
            manifest.image_name.as_str().into(),
            manifest.digest.to_bytes().into(),
            manifest.schema_version.into(),
            media_type_id.get().into(),
            manifest.artifact_media_type.clone().into(),
            manifest.total_size.into(),
            manifest.payload.clone().into(),
            config.map(|c| c.blob_id.get()).into(),
            config.map(|c| c.media_type.clone()).into(),
            config.map(|c| c.digest.to_bytes()).into(),
            config.and_then(|c| c.payload.clone()).into(),
            manifest.subject_id.map(ManifestId::get).into(),
            manifest.subject_digest.as_ref().map(OciDigest::to_bytes).into(),
            manifest.non_conformant.into(),
            manifest.non_distributable_layers.into(),
            annotations_text(&manifest.annotations)?.into(),
            now.into(),
            now.into(),
            principal.into(),
            principal.into(),
        ])?
        .returning_col(Manifests::Id)
        .to_owned())
}

async fn create(
    ex: &mut Executor<'_>,
    principal: Option<PrincipalId>,
    manifest: &NewManifest,
) -> Result<Manifest> {
    let stmt = insert_stmt(ex, principal, manifest).await?;
    let id = match ex.fetch_scalar::<i64, _>(&stmt).await {
        Ok(Some(id)) => id,
        Ok(None) => return Err(CoreError::NotFound("manifest").into()),
        Err(e) if e.is_unique_violation() => {
            tracing::debug!(digest = %manifest.digest, "manifest already exists");
            return Err(CoreError::Duplicate("manifest").into());
        }
        Err(e) => return Err(e),
    };
    get(ex, id.into()).await
}

async fn create_or_find(
    ex: &mut Executor<'_>,
    principal: Option<PrincipalId>,
    manifest: &NewManifest,
) -> Result<CreateOrFind<Manifest>> {
    let mut stmt = insert_stmt(ex, principal, manifest).await?;
    stmt.on_conflict(
        OnConflict::columns([Manifests::RegistryId, Manifests::ImageName, Manifests::Digest])
            .do_nothing()
            .to_owned(),
    );

    match ex.fetch_scalar::<i64, _>(&stmt).await? {
        Some(id) => Ok(CreateOrFind::Created(get(ex, id.into()).await?)),
        None => Ok(CreateOrFind::Found(
            find_by_digest(ex, manifest.registry_id, &manifest.image_name, &manifest.digest)
                .await?,
        )),
    }
}

async fn get(ex: &mut Executor<'_>, id: ManifestId) -> Result<Manifest> {
    let mut stmt = manifest_select();
    stmt.and_where(Expr::col((Manifests::Table, Manifests::Id)).eq(id.get()));
    fetch_manifest(ex, &stmt).await
}

async fn find_by_id(ex: &mut Executor<'_>, registry_id: RegistryId, id: ManifestId) -> Result<Manifest> {
    let mut stmt = manifest_select();
    stmt.and_where(Expr::col((Manifests::Table, Manifests::RegistryId)).eq(registry_id.get()))
        .and_where(Expr::col((Manifests::Table, Manifests::Id)).eq(id.get()));
    fetch_manifest(ex, &stmt).await
}

async fn find_by_digest(
    ex: &mut Executor<'_>,
    registry_id: RegistryId,
    image_name: &str,
    digest: &OciDigest,
) -> Result<Manifest> {
    let mut stmt = manifest_select();
    stmt.and_where(Expr::col((Manifests::Table, Manifests::RegistryId)).eq(registry_id.get()))
        .and_where(Expr::col((Manifests::Table, Manifests::ImageName)).eq(image_name))
        .and_where(Expr::col((Manifests::Table, Manifests::Digest)).eq(digest.to_bytes()));
    fetch_manifest(ex, &stmt).await
}

fn join_tag(stmt: &mut SelectStatement, registry_id: RegistryId, image_name: &str, tag: &str) {
    stmt.inner_join(
        Tags::Table,
        Expr::col((Tags::Table, Tags::ManifestId)).equals((Manifests::Table, Manifests::Id)),
    )
    .and_where(Expr::col((Tags::Table, Tags::RegistryId)).eq(registry_id.get()))
    .and_where(Expr::col((Tags::Table, Tags::ImageName)).eq(image_name))
    .and_where(Expr::col((Tags::Table, Tags::Name)).eq(tag));
}

async fn find_by_tag_name(
    ex: &mut Executor<'_>,
    registry_id: RegistryId,
    image_name: &str,
    tag: &str,
) -> Result<Manifest> {
    let mut stmt = manifest_select();
    join_tag(&mut stmt, registry_id, image_name, tag);
    fetch_manifest(ex, &stmt).await
}

async fn get_payload(
    ex: &mut Executor<'_>,
    registry_id: RegistryId,
    image_name: &str,
    digest: &OciDigest,
) -> Result<Vec<u8>> {
    let stmt = Query::select()
        .column(Manifests::Payload)
        .from(Manifests::Table)
        .and_where(Expr::col(Manifests::RegistryId).eq(registry_id.get()))
        .and_where(Expr::col(Manifests::ImageName).eq(image_name))
        .and_where(Expr::col(Manifests::Digest).eq(digest.to_bytes()))
        .to_owned();
    ex.fetch_scalar::<Vec<u8>, _>(&stmt)
        .await?
        .ok_or_else(|| CoreError::NotFound("manifest").into())
}

async fn find_payload_by_tag_name(
    ex: &mut Executor<'_>,
    registry_id: RegistryId,
    image_name: &str,
    tag: &str,
) -> Result<Vec<u8>> {
    let mut stmt = Query::select()
        .column((Manifests::Table, Manifests::Payload))
        .from(Manifests::Table)
        .to_owned();
    join_tag(&mut stmt, registry_id, image_name, tag);
    ex.fetch_scalar::<Vec<u8>, _>(&stmt)
        .await?
        .ok_or_else(|| CoreError::NotFound("manifest").into())
}

async fn references(ex: &mut Executor<'_>, manifest: &Manifest) -> Result<Vec<Manifest>> {
    let mut stmt = manifest_select();
    stmt.inner_join(
        ManifestReferences::Table,
        Expr::col((ManifestReferences::Table, ManifestReferences::ChildId))
            .equals((Manifests::Table, Manifests::Id)),
    )
    .and_where(
        Expr::col((ManifestReferences::Table, ManifestReferences::RegistryId))
            .eq(manifest.registry_id.get()),
    )
    .and_where(
        Expr::col((ManifestReferences::Table, ManifestReferences::ParentId)).eq(manifest.id.get()),
    )
    .order_by((ManifestReferences::Table, ManifestReferences::Id), Order::Asc);
    fetch_manifests(ex, &stmt).await
}

async fn layer_blobs(ex: &mut Executor<'_>, manifest: &Manifest) -> Result<Vec<Blob>> {
    let mut stmt = blob_select();
    stmt.inner_join(
        Layers::Table,
        Expr::col((Layers::Table, Layers::BlobId)).equals((Blobs::Table, Blobs::Id)),
    )
    .and_where(Expr::col((Layers::Table, Layers::RegistryId)).eq(manifest.registry_id.get()))
    .and_where(Expr::col((Layers::Table, Layers::ManifestId)).eq(manifest.id.get()))
    .order_by((Layers::Table, Layers::Id), Order::Asc);
    fetch_blobs(ex, &stmt).await
}

async fn list_by_subject(
    ex: &mut Executor<'_>,
    registry_id: RegistryId,
    subject_id: ManifestId,
) -> Result<Vec<Manifest>> {
    let mut stmt = manifest_select();
    stmt.and_where(Expr::col((Manifests::Table, Manifests::RegistryId)).eq(registry_id.get()))
        .and_where(Expr::col((Manifests::Table, Manifests::SubjectId)).eq(subject_id.get()))
        .order_by((Manifests::Table, Manifests::Id), Order::Asc);
    fetch_manifests(ex, &stmt).await
}

async fn list_by_subject_digest(
    ex: &mut Executor<'_>,
    registry_id: RegistryId,
    digest: &OciDigest,
) -> Result<Vec<Manifest>> {
    let mut stmt = manifest_select();
    stmt.and_where(Expr::col((Manifests::Table, Manifests::RegistryId)).eq(registry_id.get()))
        .and_where(Expr::col((Manifests::Table, Manifests::SubjectDigest)).eq(digest.to_bytes()))
        .order_by((Manifests::Table, Manifests::Id), Order::Asc);
    fetch_manifests(ex, &stmt).await
}

async fn count_by_image_name(
    ex: &mut Executor<'_>,
    registry_id: RegistryId,
    image_name: &str,
) -> Result<i64> {
    let stmt = Query::select()
        .expr(Func::count(Expr::col(Manifests::Id)))
        .from(Manifests::Table)
        .and_where(Expr::col(Manifests::RegistryId).eq(registry_id.get()))
        .and_where(Expr::col(Manifests::ImageName).eq(image_name))
        .to_owned();
    Ok(ex.fetch_scalar::<i64, _>(&stmt).await?.unwrap_or(0))
}

async fn update_annotations(
    ex: &mut Executor<'_>,
    principal: Option<PrincipalId>,
    registry_id: RegistryId,
    id: ManifestId,
    expected_updated_at: DateTime<Utc>,
    annotations: &BTreeMap<String, String>,
) -> Result<Manifest> {
    let expected = expected_updated_at.timestamp_millis();
    // the version must move even when two updates land in the same millisecond
    let updated_at = now_millis().max(expected + 1);
    let stmt = Query::update()
        .table(Manifests::Table)
        .values([
            (Manifests::Annotations, annotations_text(annotations)?.into()),
            (Manifests::UpdatedAt, updated_at.into()),
            (Manifests::UpdatedBy, principal.map(PrincipalId::get).into()),
        ])
        .and_where(Expr::col(Manifests::RegistryId).eq(registry_id.get()))
        .and_where(Expr::col(Manifests::Id).eq(id.get()))
        .and_where(Expr::col(Manifests::UpdatedAt).eq(expected))
        .to_owned();

    if ex.execute(&stmt).await? == 0 {
        // distinguish a stale version from a missing row
        find_by_id(ex, registry_id, id).await?;
        tracing::debug!(manifest_id = %id, "manifest changed since it was read");
        return Err(CoreError::VersionConflict("manifest").into());
    }
    find_by_id(ex, registry_id, id).await
}

async fn execute_delete(ex: &mut Executor<'_>, stmt: &sea_query::DeleteStatement) -> Result<u64> {
    match ex.execute(stmt).await {
        Err(e) if e.is_foreign_key_violation() => {
            tracing::warn!("foreign key violation error: {e}");
            Err(CoreError::ContentReferenced.into())
        }
        r => r,
    }
}

async fn delete(
    ex: &mut Executor<'_>,
    registry_id: RegistryId,
    image_name: &str,
    digest: &OciDigest,
) -> Result<bool> {
    let stmt = Query::delete()
        .from_table(Manifests::Table)
        .and_where(Expr::col(Manifests::RegistryId).eq(registry_id.get()))
        .and_where(Expr::col(Manifests::ImageName).eq(image_name))
        .and_where(Expr::col(Manifests::Digest).eq(digest.to_bytes()))
        .to_owned();
    Ok(execute_delete(ex, &stmt).await? > 0)
}

async fn delete_by_id(ex: &mut Executor<'_>, registry_id: RegistryId, id: ManifestId) -> Result<bool> {
    let stmt = Query::delete()
        .from_table(Manifests::Table)
        .and_where(Expr::col(Manifests::RegistryId).eq(registry_id.get()))
        .and_where(Expr::col(Manifests::Id).eq(id.get()))
        .to_owned();
    Ok(execute_delete(ex, &stmt).await? > 0)
}

async fn delete_by_image_name(
    ex: &mut Executor<'_>,
    registry_id: RegistryId,
    image_name: &str,
) -> Result<bool> {
    let stmt = Query::delete()
        .from_table(Manifests::Table)
        .and_where(Expr::col(Manifests::RegistryId).eq(registry_id.get()))
        .and_where(Expr::col(Manifests::ImageName).eq(image_name))
        .to_owned();
    Ok(execute_delete(ex, &stmt).await? > 0)
}

macro_rules! impl_manifest_repository {
    ($accessor:ty) => {
        #[async_trait]
        impl ManifestRepository for $accessor {
            async fn create_manifest(&mut self, manifest: &NewManifest) -> CoreResult<Manifest> {
                let principal = self.principal();
                Ok(create(&mut self.executor()?, principal, manifest).await?)
            }

            async fn create_or_find_manifest(
                &mut self,
                manifest: &NewManifest,
            ) -> CoreResult<CreateOrFind<Manifest>> {
                let principal = self.principal();
                Ok(create_or_find(&mut self.executor()?, principal, manifest).await?)
            }

            async fn get_manifest(&mut self, id: ManifestId) -> CoreResult<Manifest> {
                Ok(get(&mut self.executor()?, id).await?)
            }

            async fn find_manifest_by_id(
                &mut self,
                registry_id: RegistryId,
                id: ManifestId,
            ) -> CoreResult<Manifest> {
                Ok(find_by_id(&mut self.executor()?, registry_id, id).await?)
            }

            async fn find_manifest_by_digest(
                &mut self,
                registry_id: RegistryId,
                image_name: &str,
                digest: &OciDigest,
            ) -> CoreResult<Manifest> {
                Ok(find_by_digest(&mut self.executor()?, registry_id, image_name, digest).await?)
            }

            async fn find_manifest_by_tag_name(
                &mut self,
                registry_id: RegistryId,
                image_name: &str,
                tag: &str,
            ) -> CoreResult<Manifest> {
                Ok(find_by_tag_name(&mut self.executor()?, registry_id, image_name, tag).await?)
            }

            async fn get_manifest_payload(
                &mut self,
                registry_id: RegistryId,
                image_name: &str,
                digest: &OciDigest,
            ) -> CoreResult<Vec<u8>> {
                Ok(get_payload(&mut self.executor()?, registry_id, image_name, digest).await?)
            }

            async fn find_manifest_payload_by_tag_name(
                &mut self,
                registry_id: RegistryId,
                image_name: &str,
                tag: &str,
            ) -> CoreResult<Vec<u8>> {
                Ok(
                    find_payload_by_tag_name(&mut self.executor()?, registry_id, image_name, tag)
                        .await?,
                )
            }

            async fn references(&mut self, manifest: &Manifest) -> CoreResult<Vec<Manifest>> {
                Ok(references(&mut self.executor()?, manifest).await?)
            }

            async fn layer_blobs(&mut self, manifest: &Manifest) -> CoreResult<Vec<Blob>> {
                Ok(layer_blobs(&mut self.executor()?, manifest).await?)
            }

            async fn list_manifests_by_subject(
                &mut self,
                registry_id: RegistryId,
                subject_id: ManifestId,
            ) -> CoreResult<Vec<Manifest>> {
                Ok(list_by_subject(&mut self.executor()?, registry_id, subject_id).await?)
            }

            async fn list_manifests_by_subject_digest(
                &mut self,
                registry_id: RegistryId,
                digest: &OciDigest,
            ) -> CoreResult<Vec<Manifest>> {
                Ok(list_by_subject_digest(&mut self.executor()?, registry_id, digest).await?)
            }

            async fn count_manifests_by_image_name(
                &mut self,
                registry_id: RegistryId,
                image_name: &str,
            ) -> CoreResult<i64> {
                Ok(count_by_image_name(&mut self.executor()?, registry_id, image_name).await?)
            }

            async fn update_manifest_annotations(
                &mut self,
                registry_id: RegistryId,
                id: ManifestId,
                expected_updated_at: DateTime<Utc>,
                annotations: &BTreeMap<String, String>,
            ) -> CoreResult<Manifest> {
                let principal = self.principal();
                Ok(update_annotations(
                    &mut self.executor()?,
                    principal,
                    registry_id,
                    id,
                    expected_updated_at,
                    annotations,
                )
                .await?)
            }

            async fn delete_manifest(
                &mut self,
                registry_id: RegistryId,
                image_name: &str,
                digest: &OciDigest,
            ) -> CoreResult<bool> {
                Ok(delete(&mut self.executor()?, registry_id, image_name, digest).await?)
            }

            async fn delete_manifest_by_id(
                &mut self,
                registry_id: RegistryId,
                id: ManifestId,
            ) -> CoreResult<bool> {
                Ok(delete_by_id(&mut self.executor()?, registry_id, id).await?)
            }

            async fn delete_manifest_by_image_name(
                &mut self,
                registry_id: RegistryId,
                image_name: &str,
            ) -> CoreResult<bool> {
                Ok(delete_by_image_name(&mut self.executor()?, registry_id, image_name).await?)
            }
        }
    };
}

impl_manifest_repository!(MetadataTx);
impl_manifest_repository!(MetadataConn);
