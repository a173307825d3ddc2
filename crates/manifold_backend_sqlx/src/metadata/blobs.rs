use async_trait::async_trait;
use sea_query::{Alias, Expr, Func, OnConflict, Query, SelectStatement};

use manifold_core::blobs::{Blob, BlobRepository, NewBlob, RegistryBlobRepository};
use manifold_core::{
    BlobId, CreateOrFind, Error as CoreError, OciDigest, PrincipalId, RegistryId,
    Result as CoreResult,
};

use super::executor::Executor;
use super::registries::map_media_type;
use super::schema::{from_millis, now_millis, Blobs, MediaTypes, RegistryBlobs};
use super::tx::{MetadataConn, MetadataTx};
use crate::errors::{Error, Result};

#[derive(sqlx::FromRow)]
pub(crate) struct BlobRow {
    id: i64,
    root_parent_id: i64,
    digest: Vec<u8>,
    media_type_id: i64,
    media_type: String,
    size: i64,
    created_at: i64,
    created_by: Option<i64>,
}

impl TryFrom<BlobRow> for Blob {
    type Error = Error;

    fn try_from(row: BlobRow) -> Result<Self> {
        Ok(Blob {
            id: row.id.into(),
            root_parent_id: row.root_parent_id.into(),
            digest: OciDigest::from_bytes(&row.digest)?,
            media_type_id: row.media_type_id.into(),
            media_type: row.media_type,
            size: row.size,
            created_at: from_millis(row.created_at)?,
            created_by: row.created_by.map(PrincipalId::from),
        })
    }
}

/// Blob columns joined with their media type, ready for filters.
pub(crate) fn blob_select() -> SelectStatement {
    Query::select()
        .columns([
            (Blobs::Table, Blobs::Id),
            (Blobs::Table, Blobs::RootParentId),
            (Blobs::Table, Blobs::Digest),
            (Blobs::Table, Blobs::MediaTypeId),
            (Blobs::Table, Blobs::Size),
            (Blobs::Table, Blobs::CreatedAt),
            (Blobs::Table, Blobs::CreatedBy),
        ])
        .column((MediaTypes::Table, MediaTypes::MediaType))
        .from(Blobs::Table)
        .inner_join(
            MediaTypes::Table,
            Expr::col((MediaTypes::Table, MediaTypes::Id))
                .equals((Blobs::Table, Blobs::MediaTypeId)),
        )
        .to_owned()
}

pub(crate) async fn fetch_blobs(ex: &mut Executor<'_>, stmt: &SelectStatement) -> Result<Vec<Blob>> {
    ex.fetch_all::<BlobRow, _>(stmt)
        .await?
        .into_iter()
        .map(Blob::try_from)
        .collect()
}

async fn fetch_blob(ex: &mut Executor<'_>, stmt: &SelectStatement) -> Result<Blob> {
    ex.fetch_optional::<BlobRow, _>(stmt)
        .await?
        .ok_or(CoreError::NotFound("blob"))?
        .try_into()
}

async fn find_by_id(ex: &mut Executor<'_>, id: BlobId) -> Result<Blob> {
    let mut stmt = blob_select();
    stmt.and_where(Expr::col((Blobs::Table, Blobs::Id)).eq(id.get()));
    fetch_blob(ex, &stmt).await
}

pub(crate) async fn find_by_digest_and_root_parent_id(
    ex: &mut Executor<'_>,
    digest: &OciDigest,
    root_parent_id: RegistryId,
) -> Result<Blob> {
    let mut stmt = blob_select();
    stmt.and_where(Expr::col((Blobs::Table, Blobs::RootParentId)).eq(root_parent_id.get()))
        .and_where(Expr::col((Blobs::Table, Blobs::Digest)).eq(digest.to_bytes()));
    fetch_blob(ex, &stmt).await
}

async fn find_by_digest_and_repo_id(
    ex: &mut Executor<'_>,
    digest: &OciDigest,
    registry_id: RegistryId,
    image_name: &str,
) -> Result<Blob> {
    let mut stmt = blob_select();
    stmt.inner_join(
        RegistryBlobs::Table,
        Expr::col((RegistryBlobs::Table, RegistryBlobs::BlobId)).equals((Blobs::Table, Blobs::Id)),
    )
    .and_where(Expr::col((RegistryBlobs::Table, RegistryBlobs::RegistryId)).eq(registry_id.get()))
    .and_where(Expr::col((RegistryBlobs::Table, RegistryBlobs::ImageName)).eq(image_name))
    .and_where(Expr::col((Blobs::Table, Blobs::Digest)).eq(digest.to_bytes()));
    fetch_blob(ex, &stmt).await
}

async fn create_or_find(
    ex: &mut Executor<'_>,
    principal: Option<PrincipalId>,
    blob: &NewBlob,
) -> Result<CreateOrFind<Blob>> {
    let media_type_id = map_media_type(ex, &blob.media_type).await?;
    let stmt = Query::insert()
        .into_table(Blobs::Table)
        .columns([
            Blobs::RootParentId,
            Blobs::Digest,
            Blobs::MediaTypeId,
            Blobs::Size,
            Blobs::CreatedAt,
            Blobs::CreatedBy,
        ])
        .values([
            blob.root_parent_id.get().into(),
            blob.digest.to_bytes().into(),
            media_type_id.get().into(),
            blob.size.into(),
            now_millis().into(),
            principal.map(PrincipalId::get).into(),
        ])?
        .on_conflict(
            OnConflict::columns([Blobs::Digest, Blobs::RootParentId])
                .do_nothing()
                .to_owned(),
        )
        .returning_col(Blobs::Id)
        .to_owned();

    match ex.fetch_scalar::<i64, _>(&stmt).await? {
        Some(id) => Ok(CreateOrFind::Created(find_by_id(ex, id.into()).await?)),
        None => {
            tracing::debug!(digest = %blob.digest, "blob already stored, returning existing row");
            Ok(CreateOrFind::Found(
                find_by_digest_and_root_parent_id(ex, &blob.digest, blob.root_parent_id).await?,
            ))
        }
    }
}

async fn delete_by_id(ex: &mut Executor<'_>, id: BlobId) -> Result<()> {
    let stmt = Query::delete()
        .from_table(Blobs::Table)
        .cond_where(Expr::col(Blobs::Id).eq(id.get()))
        .to_owned();
    match ex.execute(&stmt).await {
        Ok(0) => Err(CoreError::NotFound("blob").into()),
        Ok(_) => Ok(()),
        Err(e) if e.is_foreign_key_violation() => {
            tracing::warn!("foreign key violation error: {e}");
            Err(CoreError::ContentReferenced.into())
        }
        Err(e) => Err(e),
    }
}

async fn exists(
    ex: &mut Executor<'_>,
    registry_id: RegistryId,
    digest: &OciDigest,
    image_name: &str,
) -> Result<bool> {
    let stmt = Query::select()
        .expr(Expr::val(1i64))
        .from(Blobs::Table)
        .inner_join(
            RegistryBlobs::Table,
            Expr::col((RegistryBlobs::Table, RegistryBlobs::BlobId))
                .equals((Blobs::Table, Blobs::Id)),
        )
        .and_where(Expr::col((RegistryBlobs::Table, RegistryBlobs::RegistryId)).eq(registry_id.get()))
        .and_where(Expr::col((RegistryBlobs::Table, RegistryBlobs::ImageName)).eq(image_name))
        .and_where(Expr::col((Blobs::Table, Blobs::Digest)).eq(digest.to_bytes()))
        .limit(1)
        .to_owned();
    Ok(ex.fetch_scalar::<i64, _>(&stmt).await?.is_some())
}

async fn total_size_by_root_parent_id(
    ex: &mut Executor<'_>,
    root_parent_id: RegistryId,
) -> Result<i64> {
    // SUM over no rows is NULL and over BIGINT is NUMERIC on postgres; normalize both
    let stmt = Query::select()
        .expr(Func::coalesce([
            Func::cast_as(Func::sum(Expr::col(Blobs::Size)), Alias::new("BIGINT")).into(),
            Expr::val(0i64).into(),
        ]))
        .from(Blobs::Table)
        .and_where(Expr::col(Blobs::RootParentId).eq(root_parent_id.get()))
        .to_owned();
    Ok(ex.fetch_scalar::<i64, _>(&stmt).await?.unwrap_or(0))
}

async fn link(
    ex: &mut Executor<'_>,
    principal: Option<PrincipalId>,
    registry_id: RegistryId,
    blob_id: BlobId,
    image_name: &str,
) -> Result<bool> {
    let stmt = Query::insert()
        .into_table(RegistryBlobs::Table)
        .columns([
            RegistryBlobs::RegistryId,
            RegistryBlobs::BlobId,
            RegistryBlobs::ImageName,
            RegistryBlobs::CreatedAt,
            RegistryBlobs::CreatedBy,
        ])
        .values([
            registry_id.get().into(),
            blob_id.get().into(),
            image_name.into(),
            now_millis().into(),
            principal.map(PrincipalId::get).into(),
        ])?
        .on_conflict(
            OnConflict::columns([
                RegistryBlobs::RegistryId,
                RegistryBlobs::BlobId,
                RegistryBlobs::ImageName,
            ])
            .do_nothing()
            .to_owned(),
        )
        .to_owned();
    Ok(ex.execute(&stmt).await? == 1)
}

async fn unlink(
    ex: &mut Executor<'_>,
    registry_id: RegistryId,
    blob_id: BlobId,
    image_name: &str,
) -> Result<bool> {
    let stmt = Query::delete()
        .from_table(RegistryBlobs::Table)
        .and_where(Expr::col(RegistryBlobs::RegistryId).eq(registry_id.get()))
        .and_where(Expr::col(RegistryBlobs::BlobId).eq(blob_id.get()))
        .and_where(Expr::col(RegistryBlobs::ImageName).eq(image_name))
        .to_owned();
    Ok(ex.execute(&stmt).await? > 0)
}

async fn unlink_by_image_name(
    ex: &mut Executor<'_>,
    registry_id: RegistryId,
    image_name: &str,
) -> Result<u64> {
    let stmt = Query::delete()
        .from_table(RegistryBlobs::Table)
        .and_where(Expr::col(RegistryBlobs::RegistryId).eq(registry_id.get()))
        .and_where(Expr::col(RegistryBlobs::ImageName).eq(image_name))
        .to_owned();
    ex.execute(&stmt).await
}

macro_rules! impl_blob_repositories {
    ($accessor:ty) => {
        #[async_trait]
        impl BlobRepository for $accessor {
            async fn find_blob_by_id(&mut self, id: BlobId) -> CoreResult<Blob> {
                Ok(find_by_id(&mut self.executor()?, id).await?)
            }

            async fn find_blob_by_digest_and_root_parent_id(
                &mut self,
                digest: &OciDigest,
                root_parent_id: RegistryId,
            ) -> CoreResult<Blob> {
                Ok(find_by_digest_and_root_parent_id(&mut self.executor()?, digest, root_parent_id)
                    .await?)
            }

            async fn find_blob_by_digest_and_repo_id(
                &mut self,
                digest: &OciDigest,
                registry_id: RegistryId,
                image_name: &str,
            ) -> CoreResult<Blob> {
                Ok(
                    find_by_digest_and_repo_id(&mut self.executor()?, digest, registry_id, image_name)
                        .await?,
                )
            }

            async fn create_or_find_blob(&mut self, blob: &NewBlob) -> CoreResult<CreateOrFind<Blob>> {
                let principal = self.principal();
                Ok(create_or_find(&mut self.executor()?, principal, blob).await?)
            }

            async fn delete_blob_by_id(&mut self, id: BlobId) -> CoreResult<()> {
                Ok(delete_by_id(&mut self.executor()?, id).await?)
            }

            async fn exists_blob(
                &mut self,
                registry_id: RegistryId,
                digest: &OciDigest,
                image_name: &str,
            ) -> CoreResult<bool> {
                Ok(exists(&mut self.executor()?, registry_id, digest, image_name).await?)
            }

            async fn total_size_by_root_parent_id(
                &mut self,
                root_parent_id: RegistryId,
            ) -> CoreResult<i64> {
                Ok(total_size_by_root_parent_id(&mut self.executor()?, root_parent_id).await?)
            }
        }

        #[async_trait]
        impl RegistryBlobRepository for $accessor {
            async fn link_blob(
                &mut self,
                registry_id: RegistryId,
                blob_id: BlobId,
                image_name: &str,
            ) -> CoreResult<bool> {
                let principal = self.principal();
                Ok(link(&mut self.executor()?, principal, registry_id, blob_id, image_name).await?)
            }

            async fn unlink_blob(
                &mut self,
                registry_id: RegistryId,
                blob_id: BlobId,
                image_name: &str,
            ) -> CoreResult<bool> {
                Ok(unlink(&mut self.executor()?, registry_id, blob_id, image_name).await?)
            }

            async fn unlink_blobs_by_image_name(
                &mut self,
                registry_id: RegistryId,
                image_name: &str,
            ) -> CoreResult<u64> {
                Ok(unlink_by_image_name(&mut self.executor()?, registry_id, image_name).await?)
            }
        }
    };
}

impl_blob_repositories!(MetadataTx);
impl_blob_repositories!(MetadataConn);
