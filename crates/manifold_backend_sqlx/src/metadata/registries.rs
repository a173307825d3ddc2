use async_trait::async_trait;
use sea_query::{Expr, OnConflict, Query};

use manifold_core::registries::{MediaTypeRepository, NewRegistry, Registry, RegistryRepository};
use manifold_core::{Error as CoreError, MediaTypeId, PrincipalId, RegistryId, Result as CoreResult};

use super::executor::Executor;
use super::schema::{from_millis, now_millis, MediaTypes, Registries};
use super::tx::{MetadataConn, MetadataTx};
use crate::errors::{Error, Result};

#[derive(sqlx::FromRow)]
struct RegistryRow {
    id: i64,
    parent_id: Option<i64>,
    root_parent_id: i64,
    name: String,
    created_at: i64,
    created_by: Option<i64>,
}

impl TryFrom<RegistryRow> for Registry {
    type Error = Error;

    fn try_from(row: RegistryRow) -> Result<Self> {
        Ok(Registry {
            id: row.id.into(),
            parent_id: row.parent_id.map(RegistryId::from),
            root_parent_id: row.root_parent_id.into(),
            name: row.name,
            created_at: from_millis(row.created_at)?,
            created_by: row.created_by.map(PrincipalId::from),
        })
    }
}

const REGISTRY_COLUMNS: [Registries; 6] = [
    Registries::Id,
    Registries::ParentId,
    Registries::RootParentId,
    Registries::Name,
    Registries::CreatedAt,
    Registries::CreatedBy,
];

async fn create(
    ex: &mut Executor<'_>,
    principal: Option<PrincipalId>,
    registry: &NewRegistry,
) -> Result<Registry> {
    // children inherit the root of their parent; a root is its own root, which is only known
    // once its id has been assigned
    let root_parent_id = match registry.parent_id {
        Some(parent_id) => find(ex, parent_id).await?.root_parent_id.get(),
        None => 0,
    };
    let stmt = Query::insert()
        .into_table(Registries::Table)
        .columns([
            Registries::ParentId,
            Registries::RootParentId,
            Registries::Name,
            Registries::CreatedAt,
            Registries::CreatedBy,
        ])
        .values([
            registry.parent_id.map(RegistryId::get).into(),
            root_parent_id.into(),
            registry.name.as_str().into(),
            now_millis().into(),
            principal.map(PrincipalId::get).into(),
        ])?
        .returning_col(Registries::Id)
        .to_owned();

    let id: i64 = match ex.fetch_scalar(&stmt).await {
        Ok(Some(id)) => id,
        Ok(None) => return Err(CoreError::NotFound("registry").into()),
        Err(e) if e.is_unique_violation() => {
            tracing::debug!(name = %registry.name, "registry already exists");
            return Err(CoreError::Duplicate("registry").into());
        }
        Err(e) => return Err(e),
    };

    if registry.parent_id.is_none() {
        let stmt = Query::update()
            .table(Registries::Table)
            .value(Registries::RootParentId, id)
            .and_where(Expr::col(Registries::Id).eq(id))
            .to_owned();
        ex.execute(&stmt).await?;
    }

    find(ex, RegistryId::new(id)).await
}

async fn find(ex: &mut Executor<'_>, id: RegistryId) -> Result<Registry> {
    let stmt = Query::select()
        .columns(REGISTRY_COLUMNS)
        .from(Registries::Table)
        .and_where(Expr::col(Registries::Id).eq(id.get()))
        .to_owned();
    ex.fetch_optional::<RegistryRow, _>(&stmt)
        .await?
        .ok_or(CoreError::NotFound("registry"))?
        .try_into()
}

async fn find_by_name(
    ex: &mut Executor<'_>,
    parent_id: Option<RegistryId>,
    name: &str,
) -> Result<Registry> {
    let mut stmt = Query::select();
    stmt.columns(REGISTRY_COLUMNS)
        .from(Registries::Table)
        .and_where(Expr::col(Registries::Name).eq(name));
    match parent_id {
        Some(parent_id) => stmt.and_where(Expr::col(Registries::ParentId).eq(parent_id.get())),
        None => stmt.and_where(Expr::col(Registries::ParentId).is_null()),
    };
    ex.fetch_optional::<RegistryRow, _>(&stmt)
        .await?
        .ok_or(CoreError::NotFound("registry"))?
        .try_into()
}

/// Insert-or-find for interned media type strings.
pub(crate) async fn map_media_type(ex: &mut Executor<'_>, media_type: &str) -> Result<MediaTypeId> {
    let stmt = Query::insert()
        .into_table(MediaTypes::Table)
        .columns([MediaTypes::MediaType, MediaTypes::CreatedAt])
        .values([media_type.into(), now_millis().into()])?
        .on_conflict(
            OnConflict::column(MediaTypes::MediaType)
                .do_nothing()
                .to_owned(),
        )
        .returning_col(MediaTypes::Id)
        .to_owned();
    if let Some(id) = ex.fetch_scalar::<i64, _>(&stmt).await? {
        return Ok(id.into());
    }

    let stmt = Query::select()
        .column(MediaTypes::Id)
        .from(MediaTypes::Table)
        .and_where(Expr::col(MediaTypes::MediaType).eq(media_type))
        .to_owned();
    ex.fetch_scalar::<i64, _>(&stmt)
        .await?
        .map(MediaTypeId::from)
        .ok_or_else(|| CoreError::NotFound("media type").into())
}

async fn media_type_exists(ex: &mut Executor<'_>, media_type: &str) -> Result<bool> {
    let stmt = Query::select()
        .column(MediaTypes::Id)
        .from(MediaTypes::Table)
        .and_where(Expr::col(MediaTypes::MediaType).eq(media_type))
        .to_owned();
    Ok(ex.fetch_scalar::<i64, _>(&stmt).await?.is_some())
}

async fn find_media_type(ex: &mut Executor<'_>, id: MediaTypeId) -> Result<String> {
    let stmt = Query::select()
        .column(MediaTypes::MediaType)
        .from(MediaTypes::Table)
        .and_where(Expr::col(MediaTypes::Id).eq(id.get()))
        .to_owned();
    ex.fetch_scalar::<String, _>(&stmt)
        .await?
        .ok_or_else(|| CoreError::NotFound("media type").into())
}

macro_rules! impl_registry_repositories {
    ($accessor:ty) => {
        #[async_trait]
        impl RegistryRepository for $accessor {
            async fn create_registry(&mut self, registry: &NewRegistry) -> CoreResult<Registry> {
                let principal = self.principal();
                Ok(create(&mut self.executor()?, principal, registry).await?)
            }

            async fn find_registry(&mut self, id: RegistryId) -> CoreResult<Registry> {
                Ok(find(&mut self.executor()?, id).await?)
            }

            async fn find_registry_by_name(
                &mut self,
                parent_id: Option<RegistryId>,
                name: &str,
            ) -> CoreResult<Registry> {
                Ok(find_by_name(&mut self.executor()?, parent_id, name).await?)
            }
        }

        #[async_trait]
        impl MediaTypeRepository for $accessor {
            async fn map_media_type(&mut self, media_type: &str) -> CoreResult<MediaTypeId> {
                Ok(map_media_type(&mut self.executor()?, media_type).await?)
            }

            async fn media_type_exists(&mut self, media_type: &str) -> CoreResult<bool> {
                Ok(media_type_exists(&mut self.executor()?, media_type).await?)
            }

            async fn find_media_type(&mut self, id: MediaTypeId) -> CoreResult<String> {
                Ok(find_media_type(&mut self.executor()?, id).await?)
            }
        }
    };
}

impl_registry_repositories!(MetadataTx);
impl_registry_repositories!(MetadataConn);
