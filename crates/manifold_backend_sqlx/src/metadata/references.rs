use async_trait::async_trait;
use sea_query::{Expr, OnConflict, Order, Query};

use manifold_core::manifests::{
    ManifestReference, ManifestReferenceRepository, OciImageIndexMapping,
    OciImageIndexMappingRepository,
};
use manifold_core::{
    Error as CoreError, ManifestId, OciDigest, PrincipalId, RegistryId, Result as CoreResult,
};

use super::executor::Executor;
use super::schema::{from_millis, now_millis, ManifestReferences, Manifests, OciImageIndexMappings};
use super::tx::{MetadataConn, MetadataTx};
use crate::errors::{Error, Result};

#[derive(sqlx::FromRow)]
struct ManifestReferenceRow {
    id: i64,
    registry_id: i64,
    parent_id: i64,
    child_id: i64,
    created_at: i64,
    created_by: Option<i64>,
}

impl TryFrom<ManifestReferenceRow> for ManifestReference {
    type Error = Error;

    fn try_from(row: ManifestReferenceRow) -> Result<Self> {
        Ok(ManifestReference {
            id: row.id.into(),
            registry_id: row.registry_id.into(),
            parent_id: row.parent_id.into(),
            child_id: row.child_id.into(),
            created_at: from_millis(row.created_at)?,
            created_by: row.created_by.map(PrincipalId::from),
        })
    }
}

#[derive(sqlx::FromRow)]
struct IndexMappingRow {
    id: i64,
    parent_manifest_id: i64,
    child_digest: Vec<u8>,
    created_at: i64,
    created_by: Option<i64>,
}

impl TryFrom<IndexMappingRow> for OciImageIndexMapping {
    type Error = Error;

    fn try_from(row: IndexMappingRow) -> Result<Self> {
        Ok(OciImageIndexMapping {
            id: row.id.into(),
            parent_manifest_id: row.parent_manifest_id.into(),
            child_digest: OciDigest::from_bytes(&row.child_digest)?,
            created_at: from_millis(row.created_at)?,
            created_by: row.created_by.map(PrincipalId::from),
        })
    }
}

async fn associate(
    ex: &mut Executor<'_>,
    principal: Option<PrincipalId>,
    registry_id: RegistryId,
    parent_id: ManifestId,
    child_id: ManifestId,
) -> Result<()> {
    if parent_id == child_id {
        return Err(CoreError::ManifestSelfReference(parent_id).into());
    }

    let stmt = Query::insert()
        .into_table(ManifestReferences::Table)
        .columns([
            ManifestReferences::RegistryId,
            ManifestReferences::ParentId,
            ManifestReferences::ChildId,
            ManifestReferences::CreatedAt,
            ManifestReferences::CreatedBy,
        ])
        .values([
            registry_id.get().into(),
            parent_id.get().into(),
            child_id.get().into(),
            now_millis().into(),
            principal.map(PrincipalId::get).into(),
        ])?
        .on_conflict(
            OnConflict::columns([
                ManifestReferences::RegistryId,
                ManifestReferences::ParentId,
                ManifestReferences::ChildId,
            ])
            .do_nothing()
            .to_owned(),
        )
        .to_owned();

    match ex.execute(&stmt).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_foreign_key_violation() => {
            tracing::warn!(%parent_id, %child_id, "foreign key violation error: {e}");
            Err(CoreError::ReferencedManifestNotFound.into())
        }
        Err(e) => Err(e),
    }
}

async fn dissociate(
    ex: &mut Executor<'_>,
    registry_id: RegistryId,
    parent_id: ManifestId,
    child_id: ManifestId,
) -> Result<bool> {
    let stmt = Query::delete()
        .from_table(ManifestReferences::Table)
        .and_where(Expr::col(ManifestReferences::RegistryId).eq(registry_id.get()))
        .and_where(Expr::col(ManifestReferences::ParentId).eq(parent_id.get()))
        .and_where(Expr::col(ManifestReferences::ChildId).eq(child_id.get()))
        .to_owned();
    Ok(ex.execute(&stmt).await? > 0)
}

async fn list(
    ex: &mut Executor<'_>,
    registry_id: RegistryId,
    parent_id: ManifestId,
) -> Result<Vec<ManifestReference>> {
    let stmt = Query::select()
        .columns([
            ManifestReferences::Id,
            ManifestReferences::RegistryId,
            ManifestReferences::ParentId,
            ManifestReferences::ChildId,
            ManifestReferences::CreatedAt,
            ManifestReferences::CreatedBy,
        ])
        .from(ManifestReferences::Table)
        .and_where(Expr::col(ManifestReferences::RegistryId).eq(registry_id.get()))
        .and_where(Expr::col(ManifestReferences::ParentId).eq(parent_id.get()))
        .order_by(ManifestReferences::Id, Order::Asc)
        .to_owned();
    ex.fetch_all::<ManifestReferenceRow, _>(&stmt)
        .await?
        .into_iter()
        .map(ManifestReference::try_from)
        .collect()
}

async fn find_parent_ids(
    ex: &mut Executor<'_>,
    registry_id: RegistryId,
    child_id: ManifestId,
) -> Result<Vec<ManifestId>> {
    let stmt = Query::select()
        .column(ManifestReferences::ParentId)
        .from(ManifestReferences::Table)
        .and_where(Expr::col(ManifestReferences::RegistryId).eq(registry_id.get()))
        .and_where(Expr::col(ManifestReferences::ChildId).eq(child_id.get()))
        .order_by(ManifestReferences::ParentId, Order::Asc)
        .to_owned();
    Ok(ex
        .fetch_scalars::<i64, _>(&stmt)
        .await?
        .into_iter()
        .map(ManifestId::from)
        .collect())
}

async fn create_mapping(
    ex: &mut Executor<'_>,
    principal: Option<PrincipalId>,
    parent_manifest_id: ManifestId,
    child_digest: &OciDigest,
) -> Result<bool> {
    let stmt = Query::insert()
        .into_table(OciImageIndexMappings::Table)
        .columns([
            OciImageIndexMappings::ParentManifestId,
            OciImageIndexMappings::ChildDigest,
            OciImageIndexMappings::CreatedAt,
            OciImageIndexMappings::CreatedBy,
        ])
        .values([
            parent_manifest_id.get().into(),
            child_digest.to_bytes().into(),
            now_millis().into(),
            principal.map(PrincipalId::get).into(),
        ])?
        .on_conflict(
            OnConflict::columns([
                OciImageIndexMappings::ParentManifestId,
                OciImageIndexMappings::ChildDigest,
            ])
            .do_nothing()
            .to_owned(),
        )
        .to_owned();

    match ex.execute(&stmt).await {
        Ok(n) => Ok(n == 1),
        Err(e) if e.is_foreign_key_violation() => {
            tracing::warn!("foreign key violation error: {e}");
            Err(CoreError::NotFound("manifest").into())
        }
        Err(e) => Err(e),
    }
}

async fn mappings_by_child_digest(
    ex: &mut Executor<'_>,
    registry_id: RegistryId,
    image_name: &str,
    child_digest: &OciDigest,
) -> Result<Vec<OciImageIndexMapping>> {
    let stmt = Query::select()
        .columns(
            [
                OciImageIndexMappings::Id,
                OciImageIndexMappings::ParentManifestId,
                OciImageIndexMappings::ChildDigest,
                OciImageIndexMappings::CreatedAt,
                OciImageIndexMappings::CreatedBy,
            ]
            .map(|c| (OciImageIndexMappings::Table, c)),
        )
        .from(OciImageIndexMappings::Table)
        .inner_join(
            Manifests::Table,
            Expr::col((Manifests::Table, Manifests::Id)).equals((
                OciImageIndexMappings::Table,
                OciImageIndexMappings::ParentManifestId,
            )),
        )
        .and_where(Expr::col((Manifests::Table, Manifests::RegistryId)).eq(registry_id.get()))
        .and_where(Expr::col((Manifests::Table, Manifests::ImageName)).eq(image_name))
        .and_where(
            Expr::col((OciImageIndexMappings::Table, OciImageIndexMappings::ChildDigest))
                .eq(child_digest.to_bytes()),
        )
        .order_by(
            (OciImageIndexMappings::Table, OciImageIndexMappings::Id),
            Order::Asc,
        )
        .to_owned();
    ex.fetch_all::<IndexMappingRow, _>(&stmt)
        .await?
        .into_iter()
        .map(OciImageIndexMapping::try_from)
        .collect()
}

macro_rules! impl_reference_repositories {
    ($accessor:ty) => {
        #[async_trait]
        impl ManifestReferenceRepository for $accessor {
            async fn associate_manifest(
                &mut self,
                registry_id: RegistryId,
                parent_id: ManifestId,
                child_id: ManifestId,
            ) -> CoreResult<()> {
                let principal = self.principal();
                Ok(associate(&mut self.executor()?, principal, registry_id, parent_id, child_id)
                    .await?)
            }

            async fn dissociate_manifest(
                &mut self,
                registry_id: RegistryId,
                parent_id: ManifestId,
                child_id: ManifestId,
            ) -> CoreResult<bool> {
                Ok(dissociate(&mut self.executor()?, registry_id, parent_id, child_id).await?)
            }

            async fn list_manifest_references(
                &mut self,
                registry_id: RegistryId,
                parent_id: ManifestId,
            ) -> CoreResult<Vec<ManifestReference>> {
                Ok(list(&mut self.executor()?, registry_id, parent_id).await?)
            }

            async fn find_parent_manifest_ids(
                &mut self,
                registry_id: RegistryId,
                child_id: ManifestId,
            ) -> CoreResult<Vec<ManifestId>> {
                Ok(find_parent_ids(&mut self.executor()?, registry_id, child_id).await?)
            }
        }

        #[async_trait]
        impl OciImageIndexMappingRepository for $accessor {
            async fn create_index_mapping(
                &mut self,
                parent_manifest_id: ManifestId,
                child_digest: &OciDigest,
            ) -> CoreResult<bool> {
                let principal = self.principal();
                Ok(
                    create_mapping(&mut self.executor()?, principal, parent_manifest_id, child_digest)
                        .await?,
                )
            }

            async fn get_all_index_mappings_by_child_digest(
                &mut self,
                registry_id: RegistryId,
                image_name: &str,
                child_digest: &OciDigest,
            ) -> CoreResult<Vec<OciImageIndexMapping>> {
                Ok(mappings_by_child_digest(
                    &mut self.executor()?,
                    registry_id,
                    image_name,
                    child_digest,
                )
                .await?)
            }
        }
    };
}

impl_reference_repositories!(MetadataTx);
impl_reference_repositories!(MetadataConn);
