use async_trait::async_trait;
use sea_query::{Expr, LockType, OnConflict, Order, Query, SelectStatement};

use manifold_core::tags::{NewTag, Tag, TagPage, TagRepository};
use manifold_core::{
    validate_tag_name, Error as CoreError, ManifestId, PrincipalId, RegistryId,
    Result as CoreResult,
};

use super::executor::Executor;
use super::schema::{excluded, from_millis, now_millis, Tags};
use super::tx::{MetadataConn, MetadataTx};
use crate::errors::{Error, Result};

#[derive(sqlx::FromRow)]
struct TagRow {
    id: i64,
    name: String,
    image_name: String,
    registry_id: i64,
    manifest_id: i64,
    created_at: i64,
    updated_at: i64,
    created_by: Option<i64>,
    updated_by: Option<i64>,
}

impl TryFrom<TagRow> for Tag {
    type Error = Error;

    fn try_from(row: TagRow) -> Result<Self> {
        Ok(Tag {
            id: row.id.into(),
            name: row.name,
            image_name: row.image_name,
            registry_id: row.registry_id.into(),
            manifest_id: row.manifest_id.into(),
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            created_by: row.created_by.map(PrincipalId::from),
            updated_by: row.updated_by.map(PrincipalId::from),
        })
    }
}

fn tag_select(registry_id: RegistryId, image_name: &str) -> SelectStatement {
    Query::select()
        .columns([
            Tags::Id,
            Tags::Name,
            Tags::ImageName,
            Tags::RegistryId,
            Tags::ManifestId,
            Tags::CreatedAt,
            Tags::UpdatedAt,
            Tags::CreatedBy,
            Tags::UpdatedBy,
        ])
        .from(Tags::Table)
        .and_where(Expr::col(Tags::RegistryId).eq(registry_id.get()))
        .and_where(Expr::col(Tags::ImageName).eq(image_name))
        .to_owned()
}

async fn create_or_update(
    ex: &mut Executor<'_>,
    principal: Option<PrincipalId>,
    tag: &NewTag,
) -> Result<bool> {
    validate_tag_name(&tag.name)?;

    let now = now_millis();
    let principal = principal.map(PrincipalId::get);
    let stmt = Query::insert()
        .into_table(Tags::Table)
        .columns([
            Tags::Name,
            Tags::ImageName,
            Tags::RegistryId,
            Tags::ManifestId,
            Tags::CreatedAt,
            Tags::UpdatedAt,
            Tags::CreatedBy,
            Tags::UpdatedBy,
        ])
        .values([
            tag.name.as_str().into(),
            tag.image_name.as_str().into(),
            tag.registry_id.get().into(),
            tag.manifest_id.get().into(),
            now.into(),
            now.into(),
            principal.into(),
            principal.into(),
        ])?
        .on_conflict(
            OnConflict::columns([Tags::RegistryId, Tags::Name, Tags::ImageName])
                .update_columns([Tags::ManifestId, Tags::UpdatedAt, Tags::UpdatedBy])
                // leave the row alone when the pointer would not move
                .action_and_where(
                    Expr::col((Tags::Table, Tags::ManifestId))
                        .ne(Expr::col((excluded(), Tags::ManifestId))),
                )
                .to_owned(),
        )
        .to_owned();

    match ex.execute(&stmt).await {
        Ok(0) => {
            tracing::debug!(tag = %tag.name, manifest_id = %tag.manifest_id, "tag already points at manifest");
            Ok(false)
        }
        Ok(_) => Ok(true),
        Err(e) if e.is_foreign_key_violation() => {
            tracing::warn!(tag = %tag.name, "foreign key violation error: {e}");
            Err(CoreError::NotFound("manifest").into())
        }
        Err(e) => Err(e),
    }
}

async fn lock_by_name_for_update(
    ex: &mut Executor<'_>,
    registry_id: RegistryId,
    name: &str,
) -> Result<bool> {
    let mut stmt = Query::select()
        .column(Tags::Id)
        .from(Tags::Table)
        .and_where(Expr::col(Tags::RegistryId).eq(registry_id.get()))
        .and_where(Expr::col(Tags::Name).eq(name))
        .limit(1)
        .to_owned();
    // without row locks the runner's write lock already serializes this transaction
    if ex.capabilities().row_locks {
        stmt.lock(LockType::Update);
    }
    Ok(ex.fetch_scalar::<i64, _>(&stmt).await?.is_some())
}

async fn compare_and_swap(
    ex: &mut Executor<'_>,
    principal: Option<PrincipalId>,
    registry_id: RegistryId,
    image_name: &str,
    name: &str,
    expected: ManifestId,
    manifest_id: ManifestId,
) -> Result<()> {
    let stmt = Query::update()
        .table(Tags::Table)
        .values([
            (Tags::ManifestId, manifest_id.get().into()),
            (Tags::UpdatedAt, now_millis().into()),
            (Tags::UpdatedBy, principal.map(PrincipalId::get).into()),
        ])
        .and_where(Expr::col(Tags::RegistryId).eq(registry_id.get()))
        .and_where(Expr::col(Tags::ImageName).eq(image_name))
        .and_where(Expr::col(Tags::Name).eq(name))
        .and_where(Expr::col(Tags::ManifestId).eq(expected.get()))
        .to_owned();

    if ex.execute(&stmt).await? == 0 {
        let current = find(ex, registry_id, image_name, name).await?;
        tracing::debug!(
            tag = name,
            expected = %expected,
            current = %current.manifest_id,
            "tag moved concurrently"
        );
        return Err(CoreError::VersionConflict("tag").into());
    }
    Ok(())
}

async fn find(
    ex: &mut Executor<'_>,
    registry_id: RegistryId,
    image_name: &str,
    name: &str,
) -> Result<Tag> {
    let mut stmt = tag_select(registry_id, image_name);
    stmt.and_where(Expr::col(Tags::Name).eq(name));
    ex.fetch_optional::<TagRow, _>(&stmt)
        .await?
        .ok_or(CoreError::NotFound("tag"))?
        .try_into()
}

async fn names_by_manifest_id(ex: &mut Executor<'_>, manifest_id: ManifestId) -> Result<Vec<String>> {
    let stmt = Query::select()
        .column(Tags::Name)
        .from(Tags::Table)
        .and_where(Expr::col(Tags::ManifestId).eq(manifest_id.get()))
        .order_by(Tags::Name, Order::Asc)
        .to_owned();
    ex.fetch_scalars::<String, _>(&stmt).await
}

async fn paginated(
    ex: &mut Executor<'_>,
    registry_id: RegistryId,
    image_name: &str,
    page: &TagPage,
) -> Result<Vec<Tag>> {
    if page.limit == 0 {
        return Ok(Vec::new());
    }
    let mut stmt = tag_select(registry_id, image_name);
    if let Some(last) = &page.last {
        stmt.and_where(Expr::col(Tags::Name).gt(last.as_str()));
    }
    stmt.order_by(Tags::Name, Order::Asc)
        .limit(u64::from(page.limit));
    ex.fetch_all::<TagRow, _>(&stmt)
        .await?
        .into_iter()
        .map(Tag::try_from)
        .collect()
}

async fn has_after(
    ex: &mut Executor<'_>,
    registry_id: RegistryId,
    image_name: &str,
    last: &str,
) -> Result<bool> {
    let stmt = Query::select()
        .column(Tags::Id)
        .from(Tags::Table)
        .and_where(Expr::col(Tags::RegistryId).eq(registry_id.get()))
        .and_where(Expr::col(Tags::ImageName).eq(image_name))
        .and_where(Expr::col(Tags::Name).gt(last))
        .limit(1)
        .to_owned();
    Ok(ex.fetch_scalar::<i64, _>(&stmt).await?.is_some())
}

async fn delete_where(ex: &mut Executor<'_>, stmt: &mut sea_query::DeleteStatement) -> Result<bool> {
    stmt.from_table(Tags::Table);
    Ok(ex.execute(&*stmt).await? > 0)
}

async fn delete(
    ex: &mut Executor<'_>,
    registry_id: RegistryId,
    image_name: &str,
    name: &str,
) -> Result<bool> {
    let mut stmt = Query::delete()
        .and_where(Expr::col(Tags::RegistryId).eq(registry_id.get()))
        .and_where(Expr::col(Tags::ImageName).eq(image_name))
        .and_where(Expr::col(Tags::Name).eq(name))
        .to_owned();
    delete_where(ex, &mut stmt).await
}

async fn delete_by_name(ex: &mut Executor<'_>, registry_id: RegistryId, name: &str) -> Result<bool> {
    let mut stmt = Query::delete()
        .and_where(Expr::col(Tags::RegistryId).eq(registry_id.get()))
        .and_where(Expr::col(Tags::Name).eq(name))
        .to_owned();
    delete_where(ex, &mut stmt).await
}

async fn delete_by_manifest_id(
    ex: &mut Executor<'_>,
    registry_id: RegistryId,
    manifest_id: ManifestId,
) -> Result<bool> {
    let mut stmt = Query::delete()
        .and_where(Expr::col(Tags::RegistryId).eq(registry_id.get()))
        .and_where(Expr::col(Tags::ManifestId).eq(manifest_id.get()))
        .to_owned();
    delete_where(ex, &mut stmt).await
}

async fn delete_by_image_name(
    ex: &mut Executor<'_>,
    registry_id: RegistryId,
    image_name: &str,
) -> Result<bool> {
    let mut stmt = Query::delete()
        .and_where(Expr::col(Tags::RegistryId).eq(registry_id.get()))
        .and_where(Expr::col(Tags::ImageName).eq(image_name))
        .to_owned();
    delete_where(ex, &mut stmt).await
}

macro_rules! impl_tag_repository {
    ($accessor:ty) => {
        #[async_trait]
        impl TagRepository for $accessor {
            async fn create_or_update_tag(&mut self, tag: &NewTag) -> CoreResult<bool> {
                let principal = self.principal();
                Ok(create_or_update(&mut self.executor()?, principal, tag).await?)
            }

            async fn lock_tag_by_name_for_update(
                &mut self,
                registry_id: RegistryId,
                name: &str,
            ) -> CoreResult<bool> {
                Ok(lock_by_name_for_update(&mut self.executor()?, registry_id, name).await?)
            }

            async fn compare_and_swap_tag(
                &mut self,
                registry_id: RegistryId,
                image_name: &str,
                name: &str,
                expected: ManifestId,
                manifest_id: ManifestId,
            ) -> CoreResult<()> {
                let principal = self.principal();
                Ok(compare_and_swap(
                    &mut self.executor()?,
                    principal,
                    registry_id,
                    image_name,
                    name,
                    expected,
                    manifest_id,
                )
                .await?)
            }

            async fn find_tag(
                &mut self,
                registry_id: RegistryId,
                image_name: &str,
                name: &str,
            ) -> CoreResult<Tag> {
                Ok(find(&mut self.executor()?, registry_id, image_name, name).await?)
            }

            async fn get_tags_by_manifest_id(
                &mut self,
                manifest_id: ManifestId,
            ) -> CoreResult<Vec<String>> {
                Ok(names_by_manifest_id(&mut self.executor()?, manifest_id).await?)
            }

            async fn tags_paginated(
                &mut self,
                registry_id: RegistryId,
                image_name: &str,
                page: &TagPage,
            ) -> CoreResult<Vec<Tag>> {
                Ok(paginated(&mut self.executor()?, registry_id, image_name, page).await?)
            }

            async fn has_tags_after(
                &mut self,
                registry_id: RegistryId,
                image_name: &str,
                last: &str,
            ) -> CoreResult<bool> {
                Ok(has_after(&mut self.executor()?, registry_id, image_name, last).await?)
            }

            async fn delete_tag(
                &mut self,
                registry_id: RegistryId,
                image_name: &str,
                name: &str,
            ) -> CoreResult<bool> {
                Ok(delete(&mut self.executor()?, registry_id, image_name, name).await?)
            }

            async fn delete_tag_by_name(
                &mut self,
                registry_id: RegistryId,
                name: &str,
            ) -> CoreResult<bool> {
                Ok(delete_by_name(&mut self.executor()?, registry_id, name).await?)
            }

            async fn delete_tag_by_manifest_id(
                &mut self,
                registry_id: RegistryId,
                manifest_id: ManifestId,
            ) -> CoreResult<bool> {
                Ok(delete_by_manifest_id(&mut self.executor()?, registry_id, manifest_id).await?)
            }

            async fn delete_tags_by_image_name(
                &mut self,
                registry_id: RegistryId,
                image_name: &str,
            ) -> CoreResult<bool> {
                Ok(delete_by_image_name(&mut self.executor()?, registry_id, image_name).await?)
            }
        }
    };
}

impl_tag_repository!(MetadataTx);
impl_tag_repository!(MetadataConn);
