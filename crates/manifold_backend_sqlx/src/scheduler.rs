use manifold_core::tasks::{
    NewTask, SourceRef, TaskEventKind, TaskEventRepository, TaskRepository, TaskSourceRepository,
    TaskStatus,
};

use super::errors::Result;
use super::metadata::{MetadataPool, MetadataTx, TxOptions};

/// What [`TaskScheduler::enqueue`] did with the trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheduled {
    /// The task is pending and will be picked up by the next poll.
    Queued,
    /// A run is in flight; it will be followed by exactly one more.
    Coalesced,
    /// The same trigger was already recorded and has not failed since. Nothing changed.
    Duplicate,
}

/// The trigger side of the task engine: registry mutations call [`TaskScheduler::enqueue`] and
/// workers pick the work up later.
#[derive(Clone, Debug)]
pub struct TaskScheduler {
    metadata: MetadataPool,
}

impl TaskScheduler {
    pub fn new(metadata: MetadataPool) -> Self {
        Self { metadata }
    }

    /// Record `source` as a trigger of `task` and make sure a run will happen.
    ///
    /// Triggers for a task that is already processing never start a second run; they set
    /// `run_again` so the worker re-queues the task once the current run completes. A trigger
    /// that was already recorded only counts again after its run failed.
    #[tracing::instrument(skip(self, task), fields(key = %task.key, kind = %task.kind))]
    pub async fn enqueue(&self, task: NewTask, source: SourceRef) -> Result<Scheduled> {
        let scheduled = self
            .metadata
            .with_tx(TxOptions::read_write(), move |tx| {
                Box::pin(enqueue_in_tx(tx, task, source))
            })
            .await?;
        tracing::debug!(?scheduled, "task trigger recorded");
        Ok(scheduled)
    }
}

async fn enqueue_in_tx(tx: &mut MetadataTx, task: NewTask, source: SourceRef) -> Result<Scheduled> {
    tx.upsert_task(&task).await?;
    if !tx.insert_task_source(&task.key, &source).await? {
        return Ok(Scheduled::Duplicate);
    }

    let scheduled = match tx.lock_task_for_update(&task.key).await? {
        TaskStatus::Processing => {
            tx.set_run_again(&task.key, true).await?;
            Scheduled::Coalesced
        }
        TaskStatus::Pending => Scheduled::Queued,
        TaskStatus::Success | TaskStatus::Failure => {
            tx.update_task_status(&task.key, TaskStatus::Pending).await?;
            Scheduled::Queued
        }
    };

    let payload = serde_json::to_vec(&serde_json::json!({
        "source_type": source.source_type,
        "source_id": source.source_id,
        "coalesced": scheduled == Scheduled::Coalesced,
    }))?;
    tx.log_task_event(&task.key, TaskEventKind::Scheduled.as_str(), &payload)
        .await?;
    Ok(scheduled)
}
