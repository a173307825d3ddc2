//! Durable task records, the triggers that caused them, and their audit trail.
//!
//! A task moves `pending -> processing -> {success, failure}`. Triggers that arrive while a task
//! is processing set `run_again` instead of starting a second run; whoever completes the task
//! moves it back to pending when the flag is set.
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::ids::TaskEventId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Success,
    Failure,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "success" => Ok(TaskStatus::Success),
            "failure" => Ok(TaskStatus::Failure),
            s => Err(Error::InvalidInput(format!("unknown task status: {s}"))),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task {
    pub key: String,
    pub kind: String,
    pub payload: Vec<u8>,
    pub status: TaskStatus,
    pub run_again: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewTask {
    pub key: String,
    pub kind: String,
    pub payload: Vec<u8>,
}

/// Identifies one trigger of a task, e.g. `("manifest.pushed", "42")`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SourceRef {
    pub source_type: String,
    pub source_id: String,
}

impl SourceRef {
    pub fn new(source_type: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            source_type: source_type.into(),
            source_id: source_id.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskSource {
    pub key: String,
    pub source_type: String,
    pub source_id: String,
    pub status: TaskStatus,
    pub run_id: Option<String>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskEvent {
    pub id: TaskEventId,
    pub key: String,
    pub event: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle events written by the scheduler and worker. Other writers may log their own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskEventKind {
    Scheduled,
    Started,
    Succeeded,
    Failed,
    Requeued,
}

impl TaskEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskEventKind::Scheduled => "scheduled",
            TaskEventKind::Started => "started",
            TaskEventKind::Succeeded => "succeeded",
            TaskEventKind::Failed => "failed",
            TaskEventKind::Requeued => "requeued",
        }
    }
}

#[async_trait]
pub trait TaskRepository: Send {
    async fn find_task(&mut self, key: &str) -> Result<Task>;

    /// Insert a pending task. An existing key only has `updated_at` refreshed; its kind and
    /// payload are replaced only once the earlier run has reached a terminal status.
    async fn upsert_task(&mut self, task: &NewTask) -> Result<()>;

    /// Lock the task row ahead of a claim decision and return its status.
    async fn lock_task_for_update(&mut self, key: &str) -> Result<TaskStatus>;

    async fn set_run_again(&mut self, key: &str, run_again: bool) -> Result<()>;

    async fn update_task_status(&mut self, key: &str, status: TaskStatus) -> Result<()>;

    /// Set the status and return `run_again` in the same statement.
    async fn complete_task(&mut self, key: &str, status: TaskStatus) -> Result<bool>;

    /// Oldest first by `updated_at`.
    async fn list_pending_tasks(&mut self, limit: u32) -> Result<Vec<Task>>;
}

#[async_trait]
pub trait TaskSourceRepository: Send {
    /// Record a trigger. A repeat of a trigger whose earlier run failed becomes pending again;
    /// any other repeat is a no-op. Returns whether the trigger is now pending demand.
    async fn insert_task_source(&mut self, key: &str, source: &SourceRef) -> Result<bool>;

    /// Mark every pending source of `key` as processing under `run_id`; returns how many.
    async fn claim_task_sources(&mut self, key: &str, run_id: &str) -> Result<u64>;

    async fn update_task_source_status(
        &mut self,
        run_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<u64>;

    async fn find_task_source(&mut self, key: &str, source: &SourceRef) -> Result<TaskSource>;

    async fn list_task_sources_by_run_id(&mut self, run_id: &str) -> Result<Vec<TaskSource>>;
}

#[async_trait]
pub trait TaskEventRepository: Send {
    async fn log_task_event(&mut self, key: &str, event: &str, payload: &[u8])
        -> Result<TaskEventId>;

    async fn list_task_events(&mut self, key: &str) -> Result<Vec<TaskEvent>>;
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    #[rstest]
    #[case::pending(TaskStatus::Pending, false)]
    #[case::processing(TaskStatus::Processing, false)]
    #[case::success(TaskStatus::Success, true)]
    #[case::failure(TaskStatus::Failure, true)]
    fn status_round_trips_through_text(#[case] status: TaskStatus, #[case] terminal: bool) {
        assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        assert_eq!(status.is_terminal(), terminal);
    }

    #[test]
    fn unknown_status_is_rejected() {
        let err = "done".parse::<TaskStatus>().unwrap_err();
        assert_eq!(err.to_string(), "invalid input: unknown task status: done");
    }
}
