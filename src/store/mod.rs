//! Persistence layer: scheduled tasks, executions, reports.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Datastore, Execution, ExecutionStatus, ScheduledTask};
