//! Datastore trait and the records it persists.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;

/// A recurring task defined by a cron expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: Uuid,
    /// Five-field cron expression (minute granularity).
    pub cron: String,
    /// IANA timezone name the expression is evaluated in.
    pub timezone: String,
    /// Prompt handed to the worker when the task fires.
    pub prompt: String,
    pub is_active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Error,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "error" => Ok(ExecutionStatus::Error),
            other => Err(DatabaseError::Serialization(format!(
                "unknown execution status: {other}"
            ))),
        }
    }
}

/// One run of a prompt through the worker, scheduled or interactive.
///
/// An execution that stays `running` past any plausible duration marks
/// a dropped job (the queue is at-most-once).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    /// Set when this run was fired by a scheduled task.
    pub task_id: Option<Uuid>,
    pub prompt: String,
    pub result: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new(prompt: impl Into<String>, task_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            prompt: prompt.into(),
            result: None,
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Async persistence interface.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn create_task(&self, task: &ScheduledTask) -> Result<(), DatabaseError>;

    async fn get_task(&self, id: Uuid) -> Result<ScheduledTask, DatabaseError>;

    async fn list_tasks(&self) -> Result<Vec<ScheduledTask>, DatabaseError>;

    /// Active tasks with `next_run_at <= now`.
    async fn list_due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>, DatabaseError>;

    /// Persist a recomputed schedule after a fire.
    async fn update_task_schedule(
        &self,
        id: Uuid,
        next_run_at: DateTime<Utc>,
        last_run_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn set_task_active(&self, id: Uuid, is_active: bool) -> Result<(), DatabaseError>;

    async fn create_execution(&self, execution: &Execution) -> Result<(), DatabaseError>;

    /// Set terminal status and result, stamping `completed_at`.
    async fn complete_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        result: Option<&str>,
    ) -> Result<(), DatabaseError>;

    async fn get_execution(&self, id: Uuid) -> Result<Execution, DatabaseError>;

    async fn list_executions_for_task(
        &self,
        task_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Execution>, DatabaseError>;

    /// Persist a generated report, returning its id.
    async fn save_report(&self, title: &str, content: &str) -> Result<Uuid, DatabaseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            ExecutionStatus::Error,
        ] {
            assert_eq!(status.to_string().parse::<ExecutionStatus>().unwrap(), status);
        }
        assert!("finished".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn new_execution_is_running() {
        let execution = Execution::new("daily report", None);
        assert_eq!(execution.status, ExecutionStatus::Running);
        assert!(execution.completed_at.is_none());
        assert!(execution.task_id.is_none());
    }
}
