use async_trait::async_trait;
use sea_query::{Expr, LockType, OnConflict, Order, Query, SelectStatement};

use manifold_core::tasks::{
    NewTask, SourceRef, Task, TaskEvent, TaskEventRepository, TaskRepository, TaskSource,
    TaskSourceRepository, TaskStatus,
};
use manifold_core::{Error as CoreError, Result as CoreResult, TaskEventId};

use super::executor::Executor;
use super::schema::{excluded, from_millis, now_millis, TaskEvents, TaskSources, Tasks};
use super::tx::{MetadataConn, MetadataTx};
use crate::errors::{Error, Result};

#[derive(sqlx::FromRow)]
struct TaskRow {
    key: String,
    kind: String,
    payload: Vec<u8>,
    status: String,
    run_again: bool,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<TaskRow> for Task {
    type Error = Error;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(Task {
            key: row.key,
            kind: row.kind,
            payload: row.payload,
            status: row.status.parse()?,
            run_again: row.run_again,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskSourceRow {
    key: String,
    source_type: String,
    source_id: String,
    status: String,
    run_id: Option<String>,
    error: Option<String>,
    updated_at: i64,
}

impl TryFrom<TaskSourceRow> for TaskSource {
    type Error = Error;

    fn try_from(row: TaskSourceRow) -> Result<Self> {
        Ok(TaskSource {
            key: row.key,
            source_type: row.source_type,
            source_id: row.source_id,
            status: row.status.parse()?,
            run_id: row.run_id,
            error: row.error,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskEventRow {
    id: i64,
    key: String,
    event: String,
    payload: Vec<u8>,
    created_at: i64,
}

impl TryFrom<TaskEventRow> for TaskEvent {
    type Error = Error;

    fn try_from(row: TaskEventRow) -> Result<Self> {
        Ok(TaskEvent {
            id: row.id.into(),
            key: row.key,
            event: row.event,
            payload: row.payload,
            created_at: from_millis(row.created_at)?,
        })
    }
}

fn task_select() -> SelectStatement {
    Query::select()
        .columns([
            Tasks::Key,
            Tasks::Kind,
            Tasks::Payload,
            Tasks::Status,
            Tasks::RunAgain,
            Tasks::CreatedAt,
            Tasks::UpdatedAt,
        ])
        .from(Tasks::Table)
        .to_owned()
}

fn task_source_select() -> SelectStatement {
    Query::select()
        .columns([
            TaskSources::Key,
            TaskSources::SourceType,
            TaskSources::SourceId,
            TaskSources::Status,
            TaskSources::RunId,
            TaskSources::Error,
            TaskSources::UpdatedAt,
        ])
        .from(TaskSources::Table)
        .to_owned()
}

async fn find_task(ex: &mut Executor<'_>, key: &str) -> Result<Task> {
    let mut stmt = task_select();
    stmt.and_where(Expr::col(Tasks::Key).eq(key));
    ex.fetch_optional::<TaskRow, _>(&stmt)
        .await?
        .ok_or(CoreError::NotFound("task"))?
        .try_into()
}

async fn upsert_task(ex: &mut Executor<'_>, task: &NewTask) -> Result<()> {
    let now = now_millis();
    let finished = Expr::col((Tasks::Table, Tasks::Status))
        .is_in([TaskStatus::Success.as_str(), TaskStatus::Failure.as_str()]);
    let stmt = Query::insert()
        .into_table(Tasks::Table)
        .columns([
            Tasks::Key,
            Tasks::Kind,
            Tasks::Payload,
            Tasks::Status,
            Tasks::RunAgain,
            Tasks::CreatedAt,
            Tasks::UpdatedAt,
        ])
        .values([
            task.key.as_str().into(),
            task.kind.as_str().into(),
            task.payload.clone().into(),
            TaskStatus::Pending.as_str().into(),
            false.into(),
            now.into(),
            now.into(),
        ])?
        .on_conflict(
            // the first payload seen for a key wins until its run has finished
            OnConflict::column(Tasks::Key)
                .values([
                    (
                        Tasks::Kind,
                        Expr::case(finished.clone(), Expr::col((excluded(), Tasks::Kind)))
                            .finally(Expr::col((Tasks::Table, Tasks::Kind)))
                            .into(),
                    ),
                    (
                        Tasks::Payload,
                        Expr::case(finished, Expr::col((excluded(), Tasks::Payload)))
                            .finally(Expr::col((Tasks::Table, Tasks::Payload)))
                            .into(),
                    ),
                    (
                        Tasks::UpdatedAt,
                        Expr::col((excluded(), Tasks::UpdatedAt)).into(),
                    ),
                ])
                .to_owned(),
        )
        .to_owned();
    ex.execute(&stmt).await?;
    Ok(())
}

async fn lock_for_update(ex: &mut Executor<'_>, key: &str) -> Result<TaskStatus> {
    let mut stmt = Query::select()
        .column(Tasks::Status)
        .from(Tasks::Table)
        .and_where(Expr::col(Tasks::Key).eq(key))
        .to_owned();
    if ex.capabilities().row_locks {
        stmt.lock(LockType::Update);
    }
    let status = ex
        .fetch_scalar::<String, _>(&stmt)
        .await?
        .ok_or(CoreError::NotFound("task"))?;
    Ok(status.parse()?)
}

async fn set_run_again(ex: &mut Executor<'_>, key: &str, run_again: bool) -> Result<()> {
    let stmt = Query::update()
        .table(Tasks::Table)
        .value(Tasks::RunAgain, run_again)
        .and_where(Expr::col(Tasks::Key).eq(key))
        .to_owned();
    match ex.execute(&stmt).await? {
        0 => Err(CoreError::NotFound("task").into()),
        _ => Ok(()),
    }
}

async fn update_status(ex: &mut Executor<'_>, key: &str, status: TaskStatus) -> Result<()> {
    let mut stmt = Query::update()
        .table(Tasks::Table)
        .values([
            (Tasks::Status, status.as_str().into()),
            (Tasks::UpdatedAt, now_millis().into()),
        ])
        .and_where(Expr::col(Tasks::Key).eq(key))
        .to_owned();
    // a fresh pending cycle already covers every trigger that asked for another run
    if status == TaskStatus::Pending {
        stmt.value(Tasks::RunAgain, false);
    }
    match ex.execute(&stmt).await? {
        0 => Err(CoreError::NotFound("task").into()),
        _ => Ok(()),
    }
}

async fn complete(ex: &mut Executor<'_>, key: &str, status: TaskStatus) -> Result<bool> {
    let stmt = Query::update()
        .table(Tasks::Table)
        .values([
            (Tasks::Status, status.as_str().into()),
            (Tasks::UpdatedAt, now_millis().into()),
        ])
        .and_where(Expr::col(Tasks::Key).eq(key))
        .returning_col(Tasks::RunAgain)
        .to_owned();
    ex.fetch_scalar::<bool, _>(&stmt)
        .await?
        .ok_or_else(|| CoreError::NotFound("task").into())
}

async fn list_pending(ex: &mut Executor<'_>, limit: u32) -> Result<Vec<Task>> {
    let mut stmt = task_select();
    stmt.and_where(Expr::col(Tasks::Status).eq(TaskStatus::Pending.as_str()))
        .order_by(Tasks::UpdatedAt, Order::Asc)
        .order_by(Tasks::Key, Order::Asc)
        .limit(u64::from(limit));
    ex.fetch_all::<TaskRow, _>(&stmt)
        .await?
        .into_iter()
        .map(Task::try_from)
        .collect()
}

async fn insert_source(ex: &mut Executor<'_>, key: &str, source: &SourceRef) -> Result<bool> {
    let stmt = Query::insert()
        .into_table(TaskSources::Table)
        .columns([
            TaskSources::Key,
            TaskSources::SourceType,
            TaskSources::SourceId,
            TaskSources::Status,
            TaskSources::UpdatedAt,
        ])
        .values([
            key.into(),
            source.source_type.as_str().into(),
            source.source_id.as_str().into(),
            TaskStatus::Pending.as_str().into(),
            now_millis().into(),
        ])?
        .on_conflict(
            OnConflict::columns([TaskSources::Key, TaskSources::SourceType, TaskSources::SourceId])
                .values([
                    (TaskSources::Status, Expr::col((excluded(), TaskSources::Status)).into()),
                    (TaskSources::RunId, Option::<String>::None.into()),
                    (TaskSources::Error, Option::<String>::None.into()),
                    (
                        TaskSources::UpdatedAt,
                        Expr::col((excluded(), TaskSources::UpdatedAt)).into(),
                    ),
                ])
                // only a failed trigger is eligible to run again
                .action_and_where(
                    Expr::col((TaskSources::Table, TaskSources::Status))
                        .eq(TaskStatus::Failure.as_str()),
                )
                .to_owned(),
        )
        .to_owned();

    match ex.execute(&stmt).await {
        Ok(0) => {
            tracing::debug!(key, source_type = %source.source_type, source_id = %source.source_id, "task source already recorded");
            Ok(false)
        }
        Ok(_) => Ok(true),
        Err(e) if e.is_foreign_key_violation() => {
            tracing::warn!(key, "foreign key violation error: {e}");
            Err(CoreError::NotFound("task").into())
        }
        Err(e) => Err(e),
    }
}

async fn claim_sources(ex: &mut Executor<'_>, key: &str, run_id: &str) -> Result<u64> {
    let stmt = Query::update()
        .table(TaskSources::Table)
        .values([
            (TaskSources::Status, TaskStatus::Processing.as_str().into()),
            (TaskSources::RunId, run_id.into()),
            (TaskSources::UpdatedAt, now_millis().into()),
        ])
        .and_where(Expr::col(TaskSources::Key).eq(key))
        .and_where(Expr::col(TaskSources::Status).eq(TaskStatus::Pending.as_str()))
        .to_owned();
    ex.execute(&stmt).await
}

async fn update_source_status(
    ex: &mut Executor<'_>,
    run_id: &str,
    status: TaskStatus,
    error: Option<&str>,
) -> Result<u64> {
    let stmt = Query::update()
        .table(TaskSources::Table)
        .values([
            (TaskSources::Status, status.as_str().into()),
            (TaskSources::Error, error.map(str::to_string).into()),
            (TaskSources::UpdatedAt, now_millis().into()),
        ])
        .and_where(Expr::col(TaskSources::RunId).eq(run_id))
        .to_owned();
    ex.execute(&stmt).await
}

async fn find_source(ex: &mut Executor<'_>, key: &str, source: &SourceRef) -> Result<TaskSource> {
    let mut stmt = task_source_select();
    stmt.and_where(Expr::col(TaskSources::Key).eq(key))
        .and_where(Expr::col(TaskSources::SourceType).eq(source.source_type.as_str()))
        .and_where(Expr::col(TaskSources::SourceId).eq(source.source_id.as_str()));
    ex.fetch_optional::<TaskSourceRow, _>(&stmt)
        .await?
        .ok_or(CoreError::NotFound("task source"))?
        .try_into()
}

async fn list_sources_by_run_id(ex: &mut Executor<'_>, run_id: &str) -> Result<Vec<TaskSource>> {
    let mut stmt = task_source_select();
    stmt.and_where(Expr::col(TaskSources::RunId).eq(run_id))
        .order_by(TaskSources::Key, Order::Asc)
        .order_by(TaskSources::SourceType, Order::Asc)
        .order_by(TaskSources::SourceId, Order::Asc);
    ex.fetch_all::<TaskSourceRow, _>(&stmt)
        .await?
        .into_iter()
        .map(TaskSource::try_from)
        .collect()
}

async fn log_event(ex: &mut Executor<'_>, key: &str, event: &str, payload: &[u8]) -> Result<TaskEventId> {
    let stmt = Query::insert()
        .into_table(TaskEvents::Table)
        .columns([
            TaskEvents::Key,
            TaskEvents::Event,
            TaskEvents::Payload,
            TaskEvents::CreatedAt,
        ])
        .values([
            key.into(),
            event.into(),
            payload.to_vec().into(),
            now_millis().into(),
        ])?
        .returning_col(TaskEvents::Id)
        .to_owned();
    ex.fetch_scalar::<i64, _>(&stmt)
        .await?
        .map(TaskEventId::from)
        .ok_or_else(|| CoreError::NotFound("task event").into())
}

async fn list_events(ex: &mut Executor<'_>, key: &str) -> Result<Vec<TaskEvent>> {
    let stmt = Query::select()
        .columns([
            TaskEvents::Id,
            TaskEvents::Key,
            TaskEvents::Event,
            TaskEvents::Payload,
            TaskEvents::CreatedAt,
        ])
        .from(TaskEvents::Table)
        .and_where(Expr::col(TaskEvents::Key).eq(key))
        .order_by(TaskEvents::Id, Order::Asc)
        .to_owned();
    ex.fetch_all::<TaskEventRow, _>(&stmt)
        .await?
        .into_iter()
        .map(TaskEvent::try_from)
        .collect()
}

macro_rules! impl_task_repositories {
    ($accessor:ty) => {
        #[async_trait]
        impl TaskRepository for $accessor {
            async fn find_task(&mut self, key: &str) -> CoreResult<Task> {
                Ok(find_task(&mut self.executor()?, key).await?)
            }

            async fn upsert_task(&mut self, task: &NewTask) -> CoreResult<()> {
                Ok(upsert_task(&mut self.executor()?, task).await?)
            }

            async fn lock_task_for_update(&mut self, key: &str) -> CoreResult<TaskStatus> {
                Ok(lock_for_update(&mut self.executor()?, key).await?)
            }

            async fn set_run_again(&mut self, key: &str, run_again: bool) -> CoreResult<()> {
                Ok(set_run_again(&mut self.executor()?, key, run_again).await?)
            }

            async fn update_task_status(&mut self, key: &str, status: TaskStatus) -> CoreResult<()> {
                Ok(update_status(&mut self.executor()?, key, status).await?)
            }

            async fn complete_task(&mut self, key: &str, status: TaskStatus) -> CoreResult<bool> {
                Ok(complete(&mut self.executor()?, key, status).await?)
            }

            async fn list_pending_tasks(&mut self, limit: u32) -> CoreResult<Vec<Task>> {
                Ok(list_pending(&mut self.executor()?, limit).await?)
            }
        }

        #[async_trait]
        impl TaskSourceRepository for $accessor {
            async fn insert_task_source(&mut self, key: &str, source: &SourceRef) -> CoreResult<bool> {
                Ok(insert_source(&mut self.executor()?, key, source).await?)
            }

            async fn claim_task_sources(&mut self, key: &str, run_id: &str) -> CoreResult<u64> {
                Ok(claim_sources(&mut self.executor()?, key, run_id).await?)
            }

            async fn update_task_source_status(
                &mut self,
                run_id: &str,
                status: TaskStatus,
                error: Option<&str>,
            ) -> CoreResult<u64> {
                Ok(update_source_status(&mut self.executor()?, run_id, status, error).await?)
            }

            async fn find_task_source(
                &mut self,
                key: &str,
                source: &SourceRef,
            ) -> CoreResult<TaskSource> {
                Ok(find_source(&mut self.executor()?, key, source).await?)
            }

            async fn list_task_sources_by_run_id(
                &mut self,
                run_id: &str,
            ) -> CoreResult<Vec<TaskSource>> {
                Ok(list_sources_by_run_id(&mut self.executor()?, run_id).await?)
            }
        }

        #[async_trait]
        impl TaskEventRepository for $accessor {
            async fn log_task_event(
                &mut self,
                key: &str,
                event: &str,
                payload: &[u8],
            ) -> CoreResult<TaskEventId> {
                Ok(log_event(&mut self.executor()?, key, event, payload).await?)
            }

            async fn list_task_events(&mut self, key: &str) -> CoreResult<Vec<TaskEvent>> {
                Ok(list_events(&mut self.executor()?, key).await?)
            }
        }
    };
}

impl_task_repositories!(MetadataTx);
impl_task_repositories!(MetadataConn);
