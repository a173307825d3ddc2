use async_trait::async_trait;
use sea_query::{Expr, OnConflict, Order, Query};

use manifold_core::blobs::Blob;
use manifold_core::manifests::{Layer, LayerRepository, Manifest};
use manifold_core::{
    BlobId, Error as CoreError, ManifestId, PrincipalId, Result as CoreResult,
};

use super::executor::Executor;
use super::schema::{from_millis, now_millis, Layers};
use super::tx::{MetadataConn, MetadataTx};
use crate::errors::{Error, Result};

#[derive(sqlx::FromRow)]
struct LayerRow {
    id: i64,
    registry_id: i64,
    manifest_id: i64,
    media_type_id: i64,
    blob_id: i64,
    size: i64,
    created_at: i64,
    created_by: Option<i64>,
}

impl TryFrom<LayerRow> for Layer {
    type Error = Error;

    fn try_from(row: LayerRow) -> Result<Self> {
        Ok(Layer {
            id: row.id.into(),
            registry_id: row.registry_id.into(),
            manifest_id: row.manifest_id.into(),
            media_type_id: row.media_type_id.into(),
            blob_id: BlobId::new(row.blob_id),
            size: row.size,
            created_at: from_millis(row.created_at)?,
            created_by: row.created_by.map(PrincipalId::from),
        })
    }
}

async fn associate(
    ex: &mut Executor<'_>,
    principal: Option<PrincipalId>,
    manifest: &Manifest,
    blob: &Blob,
) -> Result<()> {
    let stmt = Query::insert()
        .into_table(Layers::Table)
        .columns([
            Layers::RegistryId,
            Layers::ManifestId,
            Layers::MediaTypeId,
            Layers::BlobId,
            Layers::Size,
            Layers::CreatedAt,
            Layers::CreatedBy,
        ])
        .values([
            manifest.registry_id.get().into(),
            manifest.id.get().into(),
            blob.media_type_id.get().into(),
            blob.id.get().into(),
            blob.size.into(),
            now_millis().into(),
            principal.map(PrincipalId::get).into(),
        ])?
        .on_conflict(
            OnConflict::columns([Layers::RegistryId, Layers::ManifestId, Layers::BlobId])
                .do_nothing()
                .to_owned(),
        )
        .to_owned();

    match ex.execute(&stmt).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_foreign_key_violation() => {
            tracing::warn!(manifest_id = %manifest.id, "foreign key violation error: {e}");
            Err(CoreError::ReferencedManifestNotFound.into())
        }
        Err(e) => Err(e),
    }
}

async fn dissociate(ex: &mut Executor<'_>, manifest: &Manifest, blob: &Blob) -> Result<bool> {
    let stmt = Query::delete()
        .from_table(Layers::Table)
        .and_where(Expr::col(Layers::RegistryId).eq(manifest.registry_id.get()))
        .and_where(Expr::col(Layers::ManifestId).eq(manifest.id.get()))
        .and_where(Expr::col(Layers::BlobId).eq(blob.id.get()))
        .to_owned();
    Ok(ex.execute(&stmt).await? > 0)
}

async fn list_by_manifest_id(ex: &mut Executor<'_>, manifest_id: ManifestId) -> Result<Vec<Layer>> {
    let stmt = Query::select()
        .columns([
            Layers::Id,
            Layers::RegistryId,
            Layers::ManifestId,
            Layers::MediaTypeId,
            Layers::BlobId,
            Layers::Size,
            Layers::CreatedAt,
            Layers::CreatedBy,
        ])
        .from(Layers::Table)
        .and_where(Expr::col(Layers::ManifestId).eq(manifest_id.get()))
        .order_by(Layers::Id, Order::Asc)
        .to_owned();
    ex.fetch_all::<LayerRow, _>(&stmt)
        .await?
        .into_iter()
        .map(Layer::try_from)
        .collect()
}

macro_rules! impl_layer_repository {
    ($accessor:ty) => {
        #[async_trait]
        impl LayerRepository for $accessor {
            async fn associate_layer_blob(
                &mut self,
                manifest: &Manifest,
                blob: &Blob,
            ) -> CoreResult<()> {
                let principal = self.principal();
                Ok(associate(&mut self.executor()?, principal, manifest, blob).await?)
            }

            async fn dissociate_layer_blob(
                &mut self,
                manifest: &Manifest,
                blob: &Blob,
            ) -> CoreResult<bool> {
                Ok(dissociate(&mut self.executor()?, manifest, blob).await?)
            }

            async fn get_all_layers_by_manifest_id(
                &mut self,
                manifest_id: ManifestId,
            ) -> CoreResult<Vec<Layer>> {
                Ok(list_by_manifest_id(&mut self.executor()?, manifest_id).await?)
            }
        }
    };
}

impl_layer_repository!(MetadataTx);
impl_layer_repository!(MetadataConn);
