//! In-flight execution registry.
//!
//! Tracks dispatched executions so the HTTP layer can answer status
//! queries without a datastore round trip, and maps execution ids to
//! stream ids for reattachment. Entries are inserted at dispatch and
//! pruned on a timer; the datastore stays the source of truth for
//! finished runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A dispatched, possibly still running execution.
#[derive(Debug, Clone)]
pub struct ExecutionEntry {
    pub execution_id: Uuid,
    pub stream_id: String,
    pub started_at: DateTime<Utc>,
}

/// Registry of recently dispatched executions.
pub struct ExecutionRegistry {
    entries: RwLock<HashMap<Uuid, ExecutionEntry>>,
    ttl: Duration,
}

impl ExecutionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn insert(&self, execution_id: Uuid, stream_id: impl Into<String>) {
        let entry = ExecutionEntry {
            execution_id,
            stream_id: stream_id.into(),
            started_at: Utc::now(),
        };
        self.entries.write().await.insert(execution_id, entry);
    }

    pub async fn get(&self, execution_id: Uuid) -> Option<ExecutionEntry> {
        self.entries.read().await.get(&execution_id).cloned()
    }

    pub async fn remove(&self, execution_id: Uuid) -> Option<ExecutionEntry> {
        self.entries.write().await.remove(&execution_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drop entries older than the TTL. Returns the number removed.
    pub async fn prune_expired(&self) -> usize {
        let cutoff =
            Utc::now() - chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::hours(1));
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.started_at > cutoff);
        before - entries.len()
    }
}

/// Spawn the registry prune task.
pub fn spawn_prune_task(
    registry: Arc<ExecutionRegistry>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // Skip immediate first tick
        loop {
            ticker.tick().await;
            let removed = registry.prune_expired().await;
            if removed > 0 {
                tracing::debug!(removed, "Pruned expired execution entries");
            }
        }
    })
}
