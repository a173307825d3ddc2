use std::collections::HashSet;

use async_trait::async_trait;
use sea_query::{Cond, Expr, Order, Query, SelectStatement};

use manifold_core::quarantine::{QuarantineArtifact, QuarantineRepository, QuarantineScope};
use manifold_core::{
    ArtifactId, Error as CoreError, ImageId, NodeId, PrincipalId, RegistryId,
    Result as CoreResult,
};

use super::executor::Executor;
use super::schema::{from_millis, now_millis, QuarantineArtifacts};
use super::tx::{MetadataConn, MetadataTx};
use crate::errors::{Error, Result};

#[derive(sqlx::FromRow)]
struct QuarantineRow {
    id: i64,
    node_id: Option<String>,
    reason: String,
    registry_id: i64,
    image_id: Option<i64>,
    artifact_id: Option<i64>,
    created_at: i64,
    created_by: Option<i64>,
}

impl TryFrom<QuarantineRow> for QuarantineArtifact {
    type Error = Error;

    fn try_from(row: QuarantineRow) -> Result<Self> {
        Ok(QuarantineArtifact {
            id: row.id.into(),
            node_id: row.node_id.map(NodeId::new),
            reason: row.reason,
            registry_id: row.registry_id.into(),
            image_id: row.image_id.map(ImageId::from),
            artifact_id: row.artifact_id.map(ArtifactId::from),
            created_at: from_millis(row.created_at)?,
            created_by: row.created_by.map(PrincipalId::from),
        })
    }
}

fn quarantine_select() -> SelectStatement {
    Query::select()
        .columns([
            QuarantineArtifacts::Id,
            QuarantineArtifacts::NodeId,
            QuarantineArtifacts::Reason,
            QuarantineArtifacts::RegistryId,
            QuarantineArtifacts::ImageId,
            QuarantineArtifacts::ArtifactId,
            QuarantineArtifacts::CreatedAt,
            QuarantineArtifacts::CreatedBy,
        ])
        .from(QuarantineArtifacts::Table)
        .to_owned()
}

// A stored NULL covers every value at that level. An unset level in the request only matches
// holds that leave the level open.
fn covering<V>(col: QuarantineArtifacts, value: Option<V>) -> Cond
where
    V: Into<sea_query::Value>,
{
    match value {
        Some(v) => {
            let v: sea_query::Value = v.into();
            Cond::any()
                .add(Expr::col(col).is_null())
                .add(Expr::col(col).eq(v))
        }
        None => Cond::all().add(Expr::col(col).is_null()),
    }
}

// Exact match on every level, NULL included.
fn exactly<V>(col: QuarantineArtifacts, value: Option<V>) -> Cond
where
    V: Into<sea_query::Value>,
{
    match value {
        Some(v) => {
            let v: sea_query::Value = v.into();
            Cond::all().add(Expr::col(col).eq(v))
        }
        None => Cond::all().add(Expr::col(col).is_null()),
    }
}

async fn create(
    ex: &mut Executor<'_>,
    principal: Option<PrincipalId>,
    scope: &QuarantineScope,
    reason: &str,
) -> Result<QuarantineArtifact> {
    if reason.is_empty() {
        return Err(CoreError::InvalidInput("quarantine reason must not be empty".to_string()).into());
    }
    let stmt = Query::insert()
        .into_table(QuarantineArtifacts::Table)
        .columns([
            QuarantineArtifacts::NodeId,
            QuarantineArtifacts::Reason,
            QuarantineArtifacts::RegistryId,
            QuarantineArtifacts::ImageId,
            QuarantineArtifacts::ArtifactId,
            QuarantineArtifacts::CreatedAt,
            QuarantineArtifacts::CreatedBy,
        ])
        .values([
            scope.node_id.as_ref().map(|n| n.as_str().to_string()).into(),
            reason.into(),
            scope.registry_id.get().into(),
            scope.image_id.map(ImageId::get).into(),
            scope.artifact_id.map(ArtifactId::get).into(),
            now_millis().into(),
            principal.map(PrincipalId::get).into(),
        ])?
        .returning_col(QuarantineArtifacts::Id)
        .to_owned();

    let id = ex
        .fetch_scalar::<i64, _>(&stmt)
        .await?
        .ok_or(CoreError::NotFound("quarantine"))?;

    let mut stmt = quarantine_select();
    stmt.and_where(Expr::col(QuarantineArtifacts::Id).eq(id));
    ex.fetch_optional::<QuarantineRow, _>(&stmt)
        .await?
        .ok_or(CoreError::NotFound("quarantine"))?
        .try_into()
}

async fn find(
    ex: &mut Executor<'_>,
    scope: &QuarantineScope,
) -> Result<Option<QuarantineArtifact>> {
    let mut stmt = quarantine_select();
    stmt.and_where(Expr::col(QuarantineArtifacts::RegistryId).eq(scope.registry_id.get()))
        .cond_where(covering(
            QuarantineArtifacts::ImageId,
            scope.image_id.map(ImageId::get),
        ))
        .cond_where(covering(
            QuarantineArtifacts::ArtifactId,
            scope.artifact_id.map(ArtifactId::get),
        ))
        .cond_where(covering(
            QuarantineArtifacts::NodeId,
            scope.node_id.as_ref().map(|n| n.as_str().to_string()),
        ))
        // most specific hold first
        .order_by_expr(Expr::col(QuarantineArtifacts::NodeId).is_null(), Order::Asc)
        .order_by_expr(Expr::col(QuarantineArtifacts::ArtifactId).is_null(), Order::Asc)
        .order_by_expr(Expr::col(QuarantineArtifacts::ImageId).is_null(), Order::Asc)
        .order_by(QuarantineArtifacts::Id, Order::Asc)
        .limit(1);

    ex.fetch_optional::<QuarantineRow, _>(&stmt)
        .await?
        .map(QuarantineArtifact::try_from)
        .transpose()
}

async fn delete(ex: &mut Executor<'_>, scope: &QuarantineScope) -> Result<bool> {
    let stmt = Query::delete()
        .from_table(QuarantineArtifacts::Table)
        .and_where(Expr::col(QuarantineArtifacts::RegistryId).eq(scope.registry_id.get()))
        .cond_where(exactly(
            QuarantineArtifacts::ImageId,
            scope.image_id.map(ImageId::get),
        ))
        .cond_where(exactly(
            QuarantineArtifacts::ArtifactId,
            scope.artifact_id.map(ArtifactId::get),
        ))
        .cond_where(exactly(
            QuarantineArtifacts::NodeId,
            scope.node_id.as_ref().map(|n| n.as_str().to_string()),
        ))
        .to_owned();
    Ok(ex.execute(&stmt).await? > 0)
}

async fn status_for_images(
    ex: &mut Executor<'_>,
    registry_id: RegistryId,
    image_ids: &[ImageId],
) -> Result<Vec<bool>> {
    if image_ids.is_empty() {
        return Ok(Vec::new());
    }

    let stmt = Query::select()
        .distinct()
        .column(QuarantineArtifacts::ImageId)
        .from(QuarantineArtifacts::Table)
        .and_where(Expr::col(QuarantineArtifacts::RegistryId).eq(registry_id.get()))
        .and_where(
            Expr::col(QuarantineArtifacts::ImageId)
                .is_in(image_ids.iter().map(|id| id.get())),
        )
        .to_owned();
    let held: HashSet<i64> = ex
        .fetch_scalars::<i64, _>(&stmt)
        .await?
        .into_iter()
        .collect();

    Ok(image_ids.iter().map(|id| held.contains(&id.get())).collect())
}

macro_rules! impl_quarantine_repository {
    ($accessor:ty) => {
        #[async_trait]
        impl QuarantineRepository for $accessor {
            async fn create_quarantine(
                &mut self,
                scope: &QuarantineScope,
                reason: &str,
            ) -> CoreResult<QuarantineArtifact> {
                let principal = self.principal();
                Ok(create(&mut self.executor()?, principal, scope, reason).await?)
            }

            async fn find_quarantine(
                &mut self,
                scope: &QuarantineScope,
            ) -> CoreResult<Option<QuarantineArtifact>> {
                Ok(find(&mut self.executor()?, scope).await?)
            }

            async fn delete_quarantine(&mut self, scope: &QuarantineScope) -> CoreResult<bool> {
                Ok(delete(&mut self.executor()?, scope).await?)
            }

            async fn quarantine_status_for_images(
                &mut self,
                registry_id: RegistryId,
                image_ids: &[ImageId],
            ) -> CoreResult<Vec<bool>> {
                Ok(status_for_images(&mut self.executor()?, registry_id, image_ids).await?)
            }
        }
    };
}

impl_quarantine_repository!(MetadataTx);
impl_quarantine_repository!(MetadataConn);
