//! Cron scheduler.
//!
//! Tasks live in the datastore with a precomputed `next_run_at`. A ticker
//! (or the `/cron/tick` endpoint) asks for due tasks, fires each one by
//! creating an Execution and enqueuing a job, then recomputes the next
//! fire time from *now*. A task that was due several times while the
//! process was down fires once, not once per missed slot.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::queue::{Job, JobKind, JobQueue};
use crate::store::{Datastore, Execution, ScheduledTask};

/// Accept the common five-field cron form by prepending a seconds field.
fn normalize_cron(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

/// Compute the next fire time strictly after `now`, evaluated in `tz_name`.
pub fn next_run_after(
    expression: &str,
    tz_name: &str,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, SchedulerError> {
    let normalized = normalize_cron(expression);
    let schedule =
        cron::Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;
    let tz: Tz = tz_name
        .parse()
        .map_err(|_| SchedulerError::UnknownTimezone(tz_name.to_string()))?;

    schedule
        .after(&now.with_timezone(&tz))
        .next()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| SchedulerError::InvalidCron {
            expression: expression.to_string(),
            reason: "no upcoming fire time".to_string(),
        })
}

/// Fires due tasks into the job queue.
pub struct Scheduler {
    store: Arc<dyn Datastore>,
    queue: Arc<dyn JobQueue>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Datastore>, queue: Arc<dyn JobQueue>) -> Self {
        Self { store, queue }
    }

    /// Validate and persist a new task. The expression and timezone are
    /// checked here so bad input fails at creation, not at fire time.
    pub async fn create_task(
        &self,
        cron: &str,
        timezone: &str,
        prompt: &str,
    ) -> Result<ScheduledTask, SchedulerError> {
        let now = Utc::now();
        let next_run_at = next_run_after(cron, timezone, now)?;

        let task = ScheduledTask {
            id: Uuid::new_v4(),
            cron: cron.to_string(),
            timezone: timezone.to_string(),
            prompt: prompt.to_string(),
            is_active: true,
            last_run_at: None,
            next_run_at,
            created_at: now,
            updated_at: now,
        };
        self.store.create_task(&task).await?;
        info!(task_id = %task.id, cron, next_run = %next_run_at, "Task scheduled");
        Ok(task)
    }

    /// Fire one task: record the execution, enqueue the job, advance the
    /// schedule. The job's stream id is the execution id, so clients can
    /// attach to the output stream knowing only the execution.
    async fn fire(&self, task: &ScheduledTask, now: DateTime<Utc>) -> Result<Uuid, SchedulerError> {
        let execution = Execution::new(task.prompt.clone(), Some(task.id));
        self.store.create_execution(&execution).await?;

        let stream_id = execution.id.to_string();
        let payload = json!({
            "prompt": task.prompt,
            "execution_id": execution.id,
            "task_id": task.id,
        });
        self.queue
            .enqueue(Job::new(JobKind::Task, stream_id, payload))
            .await?;

        // Recompute from now. A task whose timezone row has gone bad
        // should not wedge the whole tick, so fall back to UTC here.
        let next = next_run_after(&task.cron, &task.timezone, now)
            .or_else(|_| next_run_after(&task.cron, "UTC", now))?;
        self.store.update_task_schedule(task.id, next, now).await?;

        info!(task_id = %task.id, execution_id = %execution.id, next_run = %next, "Task fired");
        Ok(execution.id)
    }

    /// Fire everything due at `now`. Returns the number fired. A failure
    /// on one task is logged and does not stop the others.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let due = self.store.list_due_tasks(now).await?;
        let mut fired = 0;
        for task in &due {
            match self.fire(task, now).await {
                Ok(_) => fired += 1,
                Err(e) => warn!(task_id = %task.id, "Failed to fire task: {e}"),
            }
        }
        Ok(fired)
    }
}

/// Spawn the scheduler ticker background task.
pub fn spawn_ticker(scheduler: Arc<Scheduler>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // Skip immediate first tick
        loop {
            ticker.tick().await;
            match scheduler.tick(Utc::now()).await {
                Ok(fired) if fired > 0 => tracing::debug!(fired, "Scheduler tick"),
                Ok(_) => {}
                Err(e) => tracing::error!("Scheduler tick failed: {e}"),
            }
        }
    })
}
