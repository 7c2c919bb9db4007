//! Durable job queue and per-stream chunk log.
//!
//! The queue carries two things on one shared store: a FIFO list of jobs,
//! and an append-only chunk log per stream id. The chunk log is the only
//! synchronization between a worker (writer) and any relays (readers):
//! append-only, monotonic offsets, terminated by a sentinel chunk.

pub mod libsql;
pub mod memory;

pub use libsql::LibSqlQueue;
pub use memory::MemoryQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

/// What kind of work a job carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Chat,
    Task,
    Email,
}

impl JobKind {
    /// The string tag stored in the DB kind column.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Chat => "chat",
            JobKind::Task => "task",
            JobKind::Email => "email",
        }
    }

    pub fn parse(s: &str) -> Result<Self, QueueError> {
        match s {
            "chat" => Ok(JobKind::Chat),
            "task" => Ok(JobKind::Task),
            "email" => Ok(JobKind::Email),
            other => Err(QueueError::Serialization(format!(
                "unknown job kind: {other}"
            ))),
        }
    }
}

/// A unit of queued work, correlated with a stream id.
///
/// Produced once, consumed by exactly one worker attempt, immutable,
/// deleted on dequeue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub stream_id: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(kind: JobKind, stream_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            stream_id: stream_id.into(),
            payload,
            created_at: Utc::now(),
        }
    }
}

/// Reserved prefix marking a sentinel chunk. Legitimate payload chunks are
/// UTF-8 model output and never contain NUL; `push_chunk` enforces this.
pub const SENTINEL_PREFIX: char = '\u{0}';

const DONE_TAG: &str = "\u{0}done";
const ERROR_TAG: &str = "\u{0}err:";

/// Terminal marker ending a stream log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sentinel {
    Done,
    Error(String),
}

impl Sentinel {
    /// Encode to the reserved chunk representation.
    pub fn encode(&self) -> String {
        match self {
            Sentinel::Done => DONE_TAG.to_string(),
            Sentinel::Error(message) => format!("{ERROR_TAG}{message}"),
        }
    }

    /// Decode a chunk, returning `None` for ordinary payload chunks.
    pub fn decode(chunk: &str) -> Option<Sentinel> {
        if chunk == DONE_TAG {
            return Some(Sentinel::Done);
        }
        if let Some(message) = chunk.strip_prefix(ERROR_TAG) {
            return Some(Sentinel::Error(message.to_string()));
        }
        None
    }
}

/// Reject payload chunks that collide with the sentinel space.
pub(crate) fn validate_payload(chunk: &str) -> Result<(), QueueError> {
    if chunk.starts_with(SENTINEL_PREFIX) {
        return Err(QueueError::ReservedPrefix);
    }
    Ok(())
}

/// FIFO job queue plus append-only per-stream chunk log.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append a job to the tail and create its (empty) stream log.
    async fn enqueue(&self, job: Job) -> Result<(), QueueError>;

    /// Atomically pop the head, or `None` when the queue is empty.
    /// Callers implement their own backoff loop.
    ///
    /// Delivery is at-most-once: the job is deleted here, so a crash
    /// between pop and completion drops the attempt. The Execution row
    /// stays `running`, which is the manual-recovery signal.
    async fn poll(&self) -> Result<Option<Job>, QueueError>;

    /// Append a payload chunk and refresh the stream's TTL.
    async fn push_chunk(&self, stream_id: &str, chunk: &str) -> Result<(), QueueError>;

    /// Read chunks from `from_offset` to the current end. A missing log
    /// reads as empty — callers treat it as "nothing new yet".
    async fn read_chunks(&self, stream_id: &str, from_offset: usize)
    -> Result<Vec<String>, QueueError>;

    /// Append the Done sentinel.
    async fn mark_done(&self, stream_id: &str) -> Result<(), QueueError>;

    /// Append an Error sentinel carrying `message`.
    async fn mark_error(&self, stream_id: &str, message: &str) -> Result<(), QueueError>;

    /// Delete a stream log once fully consumed.
    async fn cleanup(&self, stream_id: &str) -> Result<(), QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_roundtrip() {
        assert_eq!(Sentinel::decode(&Sentinel::Done.encode()), Some(Sentinel::Done));
        let err = Sentinel::Error("model call failed".to_string());
        assert_eq!(Sentinel::decode(&err.encode()), Some(err));
    }

    #[test]
    fn payload_chunks_are_not_sentinels() {
        assert_eq!(Sentinel::decode("hello"), None);
        assert_eq!(Sentinel::decode("done"), None);
        assert_eq!(Sentinel::decode(""), None);
    }

    #[test]
    fn reserved_prefix_rejected() {
        assert!(validate_payload("\u{0}sneaky").is_err());
        assert!(validate_payload("ordinary text").is_ok());
    }

    #[test]
    fn job_kind_tags() {
        for kind in [JobKind::Chat, JobKind::Task, JobKind::Email] {
            assert_eq!(JobKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(JobKind::parse("bogus").is_err());
    }
}
