//! libSQL backend — async `Datastore` implementation.
//!
//! Supports local file and in-memory databases. Stores a single
//! connection reused for all operations; `libsql::Connection` is
//! `Send + Sync` and safe for concurrent async use.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{Datastore, Execution, ExecutionStatus, ScheduledTask};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path).build().await.map_err(|e| {
            DatabaseError::Connection(format!("Failed to open libSQL database: {e}"))
        })?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:").build().await.map_err(|e| {
            DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
        })?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

const TASK_COLUMNS: &str =
    "id, cron, timezone, prompt, is_active, last_run_at, next_run_at, created_at, updated_at";

fn row_to_task(row: &libsql::Row) -> Result<ScheduledTask, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Serialization(format!("task id: {e}")))?;
    let cron: String = row
        .get(1)
        .map_err(|e| DatabaseError::Serialization(format!("task cron: {e}")))?;
    let timezone: String = row
        .get(2)
        .map_err(|e| DatabaseError::Serialization(format!("task timezone: {e}")))?;
    let prompt: String = row
        .get(3)
        .map_err(|e| DatabaseError::Serialization(format!("task prompt: {e}")))?;
    let is_active: i64 = row
        .get(4)
        .map_err(|e| DatabaseError::Serialization(format!("task is_active: {e}")))?;
    let last_run_str: Option<String> = row.get(5).ok();
    let next_run_str: String = row
        .get(6)
        .map_err(|e| DatabaseError::Serialization(format!("task next_run_at: {e}")))?;
    let created_str: String = row
        .get(7)
        .map_err(|e| DatabaseError::Serialization(format!("task created_at: {e}")))?;
    let updated_str: String = row
        .get(8)
        .map_err(|e| DatabaseError::Serialization(format!("task updated_at: {e}")))?;

    Ok(ScheduledTask {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        cron,
        timezone,
        prompt,
        is_active: is_active != 0,
        last_run_at: parse_optional_datetime(&last_run_str),
        next_run_at: parse_datetime(&next_run_str),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const EXECUTION_COLUMNS: &str = "id, task_id, prompt, result, status, started_at, completed_at";

fn row_to_execution(row: &libsql::Row) -> Result<Execution, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Serialization(format!("execution id: {e}")))?;
    let task_id_str: Option<String> = row.get(1).ok();
    let prompt: String = row
        .get(2)
        .map_err(|e| DatabaseError::Serialization(format!("execution prompt: {e}")))?;
    let result: Option<String> = row.get(3).ok();
    let status_str: String = row
        .get(4)
        .map_err(|e| DatabaseError::Serialization(format!("execution status: {e}")))?;
    let started_str: String = row
        .get(5)
        .map_err(|e| DatabaseError::Serialization(format!("execution started_at: {e}")))?;
    let completed_str: Option<String> = row.get(6).ok();

    Ok(Execution {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        task_id: task_id_str.and_then(|s| Uuid::parse_str(&s).ok()),
        prompt,
        result,
        status: status_str.parse()?,
        started_at: parse_datetime(&started_str),
        completed_at: parse_optional_datetime(&completed_str),
    })
}

#[async_trait]
impl Datastore for LibSqlBackend {
    async fn create_task(&self, task: &ScheduledTask) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO tasks (id, cron, timezone, prompt, is_active, last_run_at, \
                 next_run_at, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    task.id.to_string(),
                    task.cron.clone(),
                    task.timezone.clone(),
                    task.prompt.clone(),
                    task.is_active as i64,
                    task.last_run_at.map(|dt| dt.to_rfc3339()),
                    task.next_run_at.to_rfc3339(),
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_task: {e}")))?;
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<ScheduledTask, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_task(&row),
            Ok(None) => Err(DatabaseError::NotFound {
                entity: "task".to_string(),
                id: id.to_string(),
            }),
            Err(e) => Err(DatabaseError::Query(format!("get_task row: {e}"))),
        }
    }

    async fn list_tasks(&self) -> Result<Vec<ScheduledTask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn list_due_tasks(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledTask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE is_active = 1 AND next_run_at <= ?1 ORDER BY next_run_at"
                ),
                params![now.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_due_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn update_task_schedule(
        &self,
        id: Uuid,
        next_run_at: DateTime<Utc>,
        last_run_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET next_run_at = ?2, last_run_at = ?3, updated_at = ?4 \
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    next_run_at.to_rfc3339(),
                    last_run_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_task_schedule: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "task".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn set_task_active(&self, id: Uuid, is_active: bool) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), is_active as i64, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_task_active: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "task".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn create_execution(&self, execution: &Execution) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO executions (id, task_id, prompt, result, status, started_at, \
                 completed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    execution.id.to_string(),
                    execution.task_id.map(|id| id.to_string()),
                    execution.prompt.clone(),
                    execution.result.clone(),
                    execution.status.to_string(),
                    execution.started_at.to_rfc3339(),
                    execution.completed_at.map(|dt| dt.to_rfc3339()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_execution: {e}")))?;
        Ok(())
    }

    async fn complete_execution(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        result: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE executions SET status = ?2, result = ?3, completed_at = ?4 \
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    status.to_string(),
                    result.map(|s| s.to_string()),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_execution: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "execution".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Execution, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_execution: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_execution(&row),
            Ok(None) => Err(DatabaseError::NotFound {
                entity: "execution".to_string(),
                id: id.to_string(),
            }),
            Err(e) => Err(DatabaseError::Query(format!("get_execution row: {e}"))),
        }
    }

    async fn list_executions_for_task(
        &self,
        task_id: Uuid,
        limit: usize,
    ) -> Result<Vec<Execution>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executions WHERE task_id = ?1 \
                     ORDER BY started_at DESC LIMIT ?2"
                ),
                params![task_id.to_string(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_executions_for_task: {e}")))?;

        let mut executions = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            executions.push(row_to_execution(&row)?);
        }
        Ok(executions)
    }

    async fn save_report(&self, title: &str, content: &str) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        self.conn()
            .execute(
                "INSERT INTO reports (id, title, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id.to_string(), title, content, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_report: {e}")))?;
        Ok(id)
    }
}
