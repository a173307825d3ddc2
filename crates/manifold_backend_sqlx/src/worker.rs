//! Pull-based task execution.
//!
//! A worker polls for pending tasks, claims each one in a short transaction, runs the handler
//! with no transaction open, and records the outcome in a second transaction.
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use manifold_core::tasks::{
    Task, TaskEventKind, TaskEventRepository, TaskRepository, TaskSource, TaskSourceRepository,
    TaskStatus,
};

use super::errors::Result;
use super::metadata::{MetadataPool, MetadataTx, TxOptions};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Business logic run for each claimed task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// `sources` are the triggers claimed by this run.
    async fn handle(&self, task: &Task, sources: &[TaskSource]) -> std::result::Result<(), HandlerError>;
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub batch_size: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 16,
        }
    }
}

/// A task held by one run of a worker.
#[derive(Clone, Debug)]
pub struct ClaimedTask {
    pub task: Task,
    pub run_id: String,
    pub sources: Vec<TaskSource>,
}

pub struct TaskWorker<H> {
    metadata: MetadataPool,
    handler: H,
    config: WorkerConfig,
}

impl<H: TaskHandler> TaskWorker<H> {
    pub fn new(metadata: MetadataPool, handler: H, config: WorkerConfig) -> Self {
        Self {
            metadata,
            handler,
            config,
        }
    }

    /// Process one batch of pending tasks and return how many ran.
    pub async fn run_once(&self) -> Result<usize> {
        let pending = self
            .metadata
            .conn(None)
            .await?
            .list_pending_tasks(self.config.batch_size)
            .await?;

        let mut ran = 0;
        for task in pending {
            match self.claim(&task.key).await? {
                Some(claimed) => {
                    self.execute(claimed).await?;
                    ran += 1;
                }
                None => tracing::debug!(key = %task.key, "task claimed elsewhere"),
            }
        }
        Ok(ran)
    }

    /// Poll until `shutdown` resolves. A run in progress is allowed to finish.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "task worker started"
        );
        loop {
            let ran = match self.run_once().await {
                Ok(ran) => ran,
                Err(e) => {
                    tracing::warn!("task poll failed: {e}");
                    0
                }
            };
            // keep draining while there is work, but still notice a shutdown
            let wait = if ran > 0 {
                Duration::ZERO
            } else {
                self.config.poll_interval
            };
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        tracing::info!("task worker stopped");
        Ok(())
    }

    /// Move a pending task to processing under a fresh run id. Returns `None` when another
    /// worker got there first.
    pub async fn claim(&self, key: &str) -> Result<Option<ClaimedTask>> {
        let key = key.to_string();
        let run_id = Uuid::new_v4().to_string();
        self.metadata
            .with_tx(TxOptions::read_write(), move |tx| {
                Box::pin(claim_in_tx(tx, key, run_id))
            })
            .await
    }

    /// Run the handler for a claimed task and record the outcome.
    #[tracing::instrument(skip(self, claimed), fields(key = %claimed.task.key, run_id = %claimed.run_id))]
    pub async fn execute(&self, claimed: ClaimedTask) -> Result<TaskStatus> {
        let outcome = self.handler.handle(&claimed.task, &claimed.sources).await;
        let (status, error) = match outcome {
            Ok(()) => (TaskStatus::Success, None),
            Err(e) => {
                tracing::warn!("task failed: {e}");
                (TaskStatus::Failure, Some(e.to_string()))
            }
        };

        let key = claimed.task.key;
        let run_id = claimed.run_id;
        let requeued = self
            .metadata
            .with_tx(TxOptions::read_write(), move |tx| {
                Box::pin(complete_in_tx(tx, key, run_id, status, error))
            })
            .await?;
        if requeued {
            tracing::debug!("task triggered again during run, re-queued");
        }
        Ok(status)
    }
}

async fn claim_in_tx(tx: &mut MetadataTx, key: String, run_id: String) -> Result<Option<ClaimedTask>> {
    if tx.lock_task_for_update(&key).await? != TaskStatus::Pending {
        return Ok(None);
    }
    tx.update_task_status(&key, TaskStatus::Processing).await?;
    let claimed = tx.claim_task_sources(&key, &run_id).await?;
    tx.log_task_event(&key, TaskEventKind::Started.as_str(), run_id.as_bytes())
        .await?;
    tracing::debug!(key, run_id, sources = claimed, "task claimed");

    let task = tx.find_task(&key).await?;
    let sources = tx.list_task_sources_by_run_id(&run_id).await?;
    Ok(Some(ClaimedTask {
        task,
        run_id,
        sources,
    }))
}

async fn complete_in_tx(
    tx: &mut MetadataTx,
    key: String,
    run_id: String,
    status: TaskStatus,
    error: Option<String>,
) -> Result<bool> {
    let run_again = tx.complete_task(&key, status).await?;
    tx.update_task_source_status(&run_id, status, error.as_deref())
        .await?;

    let event = match status {
        TaskStatus::Success => TaskEventKind::Succeeded,
        _ => TaskEventKind::Failed,
    };
    let payload = error.unwrap_or_default();
    tx.log_task_event(&key, event.as_str(), payload.as_bytes())
        .await?;

    if run_again {
        tx.update_task_status(&key, TaskStatus::Pending).await?;
        tx.log_task_event(&key, TaskEventKind::Requeued.as_str(), run_id.as_bytes())
            .await?;
    }
    Ok(run_again)
}
