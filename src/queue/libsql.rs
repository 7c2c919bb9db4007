//! libSQL queue backend — the durable shared store.
//!
//! One table for the FIFO job list (ordered by rowid), one for stream
//! chunks (monotonic `seq` per stream), one for stream TTL bookkeeping.
//! The atomic pop uses `DELETE ... RETURNING` so at most one worker
//! consumes a given job.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::QueueError;
use crate::queue::{Job, JobKind, JobQueue, Sentinel, validate_payload};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        stream_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS streams (
        stream_id TEXT PRIMARY KEY,
        expires_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS stream_chunks (
        stream_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        chunk TEXT NOT NULL,
        PRIMARY KEY (stream_id, seq)
    );
    CREATE INDEX IF NOT EXISTS idx_stream_chunks_stream ON stream_chunks(stream_id);
"#;

/// Durable queue on libSQL.
pub struct LibSqlQueue {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    ttl: Duration,
}

impl LibSqlQueue {
    /// Open (or create) the queue store at `path`.
    pub async fn new_local(path: &Path, ttl: Duration) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                QueueError::Unavailable(format!("failed to create queue directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| QueueError::Unavailable(format!("failed to open queue store: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| QueueError::Unavailable(format!("failed to connect: {e}")))?;

        let queue = Self {
            db: Arc::new(db),
            conn,
            ttl,
        };
        queue.init_schema().await?;
        info!(path = %path.display(), "Queue store opened");
        Ok(queue)
    }

    /// In-memory queue store (tests).
    pub async fn new_memory(ttl: Duration) -> Result<Self, QueueError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| QueueError::Unavailable(format!("failed to open queue store: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| QueueError::Unavailable(format!("failed to connect: {e}")))?;

        let queue = Self {
            db: Arc::new(db),
            conn,
            ttl,
        };
        queue.init_schema().await?;
        Ok(queue)
    }

    async fn init_schema(&self) -> Result<(), QueueError> {
        self.conn
            .execute_batch(SCHEMA)
            .await
            .map_err(|e| QueueError::Unavailable(format!("schema init: {e}")))?;
        Ok(())
    }

    fn deadline(&self) -> String {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::seconds(600));
        (Utc::now() + ttl).to_rfc3339()
    }

    /// Chunk insert and TTL refresh commit together; a chunk must never
    /// exist without a `streams` row, or the sweep cannot reclaim it.
    async fn append(&self, stream_id: &str, chunk: &str) -> Result<(), QueueError> {
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| QueueError::Backend(format!("append begin: {e}")))?;

        tx.execute(
            "INSERT INTO stream_chunks (stream_id, seq, chunk) VALUES \
             (?1, (SELECT COALESCE(MAX(seq) + 1, 0) FROM stream_chunks WHERE stream_id = ?1), ?2)",
            params![stream_id, chunk],
        )
        .await
        .map_err(|e| QueueError::Backend(format!("push_chunk: {e}")))?;

        tx.execute(
            "INSERT INTO streams (stream_id, expires_at) VALUES (?1, ?2) \
             ON CONFLICT(stream_id) DO UPDATE SET expires_at = ?2",
            params![stream_id, self.deadline()],
        )
        .await
        .map_err(|e| QueueError::Backend(format!("ttl refresh: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| QueueError::Backend(format!("append commit: {e}")))?;
        Ok(())
    }

    /// Delete streams past their TTL. Returns the number removed.
    pub async fn sweep_expired(&self) -> Result<usize, QueueError> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "DELETE FROM stream_chunks WHERE stream_id IN \
                 (SELECT stream_id FROM streams WHERE expires_at <= ?1)",
                params![now.clone()],
            )
            .await
            .map_err(|e| QueueError::Backend(format!("sweep chunks: {e}")))?;
        let removed = self
            .conn
            .execute(
                "DELETE FROM streams WHERE expires_at <= ?1",
                params![now],
            )
            .await
            .map_err(|e| QueueError::Backend(format!("sweep streams: {e}")))?;
        Ok(removed as usize)
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn row_to_job(row: &libsql::Row) -> Result<Job, QueueError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| QueueError::Serialization(format!("job id: {e}")))?;
    let kind_str: String = row
        .get(1)
        .map_err(|e| QueueError::Serialization(format!("job kind: {e}")))?;
    let stream_id: String = row
        .get(2)
        .map_err(|e| QueueError::Serialization(format!("job stream_id: {e}")))?;
    let payload_str: String = row
        .get(3)
        .map_err(|e| QueueError::Serialization(format!("job payload: {e}")))?;
    let created_str: String = row
        .get(4)
        .map_err(|e| QueueError::Serialization(format!("job created_at: {e}")))?;

    Ok(Job {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        kind: JobKind::parse(&kind_str)?,
        stream_id,
        payload: serde_json::from_str(&payload_str)
            .map_err(|e| QueueError::Serialization(format!("job payload json: {e}")))?,
        created_at: parse_datetime(&created_str),
    })
}

#[async_trait]
impl JobQueue for LibSqlQueue {
    async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| QueueError::Backend(format!("enqueue begin: {e}")))?;

        tx.execute(
            "INSERT INTO jobs (id, kind, stream_id, payload, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                job.id.to_string(),
                job.kind.as_str(),
                job.stream_id.clone(),
                job.payload.to_string(),
                job.created_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| QueueError::Backend(format!("enqueue: {e}")))?;

        // Create the stream log entry up front so readers see "empty",
        // not "missing", between enqueue and the first chunk.
        tx.execute(
            "INSERT INTO streams (stream_id, expires_at) VALUES (?1, ?2) \
             ON CONFLICT(stream_id) DO UPDATE SET expires_at = ?2",
            params![job.stream_id.clone(), self.deadline()],
        )
        .await
        .map_err(|e| QueueError::Backend(format!("enqueue stream: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| QueueError::Backend(format!("enqueue commit: {e}")))?;

        debug!(job_id = %job.id, kind = job.kind.as_str(), "Job enqueued");
        Ok(())
    }

    async fn poll(&self) -> Result<Option<Job>, QueueError> {
        let mut rows = self
            .conn
            .query(
                "DELETE FROM jobs WHERE rowid = \
                 (SELECT rowid FROM jobs ORDER BY rowid LIMIT 1) \
                 RETURNING id, kind, stream_id, payload, created_at",
                (),
            )
            .await
            .map_err(|e| QueueError::Backend(format!("poll: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(QueueError::Backend(format!("poll row: {e}"))),
        }
    }

    async fn push_chunk(&self, stream_id: &str, chunk: &str) -> Result<(), QueueError> {
        validate_payload(chunk)?;
        self.append(stream_id, chunk).await
    }

    async fn read_chunks(
        &self,
        stream_id: &str,
        from_offset: usize,
    ) -> Result<Vec<String>, QueueError> {
        let mut rows = self
            .conn
            .query(
                "SELECT chunk FROM stream_chunks WHERE stream_id = ?1 AND seq >= ?2 ORDER BY seq",
                params![stream_id, from_offset as i64],
            )
            .await
            .map_err(|e| QueueError::Backend(format!("read_chunks: {e}")))?;

        let mut chunks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let chunk: String = row
                .get(0)
                .map_err(|e| QueueError::Serialization(format!("chunk: {e}")))?;
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    async fn mark_done(&self, stream_id: &str) -> Result<(), QueueError> {
        self.append(stream_id, &Sentinel::Done.encode()).await
    }

    async fn mark_error(&self, stream_id: &str, message: &str) -> Result<(), QueueError> {
        self.append(stream_id, &Sentinel::Error(message.to_string()).encode())
            .await
    }

    async fn cleanup(&self, stream_id: &str) -> Result<(), QueueError> {
        self.conn
            .execute(
                "DELETE FROM stream_chunks WHERE stream_id = ?1",
                params![stream_id],
            )
            .await
            .map_err(|e| QueueError::Backend(format!("cleanup chunks: {e}")))?;
        self.conn
            .execute("DELETE FROM streams WHERE stream_id = ?1", params![stream_id])
            .await
            .map_err(|e| QueueError::Backend(format!("cleanup stream: {e}")))?;
        Ok(())
    }
}

/// Spawn the TTL sweep task for the durable backend.
pub fn spawn_ttl_sweep(queue: Arc<LibSqlQueue>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match queue.sweep_expired().await {
                Ok(removed) if removed > 0 => {
                    tracing::debug!(removed, "Swept expired stream logs");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Stream TTL sweep failed: {e}"),
            }
        }
    })
}
