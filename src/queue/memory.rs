//! In-process queue backend.
//!
//! Used by tests and by the degraded single-node mode when the shared
//! store is unavailable. Same semantics as the durable backend, including
//! stream TTLs enforced by a periodic sweep.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::error::QueueError;
use crate::queue::{Job, JobQueue, Sentinel, validate_payload};

struct StreamLog {
    chunks: Vec<String>,
    expires_at: DateTime<Utc>,
}

/// In-memory FIFO queue and stream logs.
pub struct MemoryQueue {
    jobs: Mutex<VecDeque<Job>>,
    streams: Mutex<HashMap<String, StreamLog>>,
    ttl: Duration,
}

impl MemoryQueue {
    pub fn new(ttl: Duration) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            streams: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn deadline(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::seconds(600))
    }

    /// Drop expired stream logs. Returns the number removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut streams = self.streams.lock().await;
        let before = streams.len();
        streams.retain(|_, log| log.expires_at > now);
        before - streams.len()
    }

    /// Number of queued jobs (for tests and health output).
    pub async fn depth(&self) -> usize {
        self.jobs.lock().await.len()
    }

    async fn append(&self, stream_id: &str, chunk: String) -> Result<(), QueueError> {
        let expires_at = self.deadline();
        let mut streams = self.streams.lock().await;
        let log = streams.entry(stream_id.to_string()).or_insert(StreamLog {
            chunks: Vec::new(),
            expires_at,
        });
        log.chunks.push(chunk);
        log.expires_at = expires_at;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        let expires_at = self.deadline();
        self.streams
            .lock()
            .await
            .entry(job.stream_id.clone())
            .or_insert(StreamLog {
                chunks: Vec::new(),
                expires_at,
            });
        self.jobs.lock().await.push_back(job);
        Ok(())
    }

    async fn poll(&self) -> Result<Option<Job>, QueueError> {
        Ok(self.jobs.lock().await.pop_front())
    }

    async fn push_chunk(&self, stream_id: &str, chunk: &str) -> Result<(), QueueError> {
        validate_payload(chunk)?;
        self.append(stream_id, chunk.to_string()).await
    }

    async fn read_chunks(
        &self,
        stream_id: &str,
        from_offset: usize,
    ) -> Result<Vec<String>, QueueError> {
        let streams = self.streams.lock().await;
        Ok(streams
            .get(stream_id)
            .map(|log| log.chunks.iter().skip(from_offset).cloned().collect())
            .unwrap_or_default())
    }

    async fn mark_done(&self, stream_id: &str) -> Result<(), QueueError> {
        self.append(stream_id, Sentinel::Done.encode()).await
    }

    async fn mark_error(&self, stream_id: &str, message: &str) -> Result<(), QueueError> {
        self.append(stream_id, Sentinel::Error(message.to_string()).encode())
            .await
    }

    async fn cleanup(&self, stream_id: &str) -> Result<(), QueueError> {
        self.streams.lock().await.remove(stream_id);
        Ok(())
    }
}

/// Spawn the TTL sweep task (runs every `interval`).
pub fn spawn_ttl_sweep(queue: Arc<MemoryQueue>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // Skip immediate first tick
        loop {
            ticker.tick().await;
            let removed = queue.sweep_expired().await;
            if removed > 0 {
                tracing::debug!(removed, "Swept expired stream logs");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobKind;
    use serde_json::json;

    fn queue() -> MemoryQueue {
        MemoryQueue::new(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn fifo_order() {
        let q = queue();
        for i in 0..3 {
            q.enqueue(Job::new(JobKind::Chat, format!("s{i}"), json!({"n": i})))
                .await
                .unwrap();
        }
        for i in 0..3 {
            let job = q.poll().await.unwrap().unwrap();
            assert_eq!(job.stream_id, format!("s{i}"));
        }
        assert!(q.poll().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn enqueue_creates_empty_stream_log() {
        let q = queue();
        q.enqueue(Job::new(JobKind::Task, "s1", json!({})))
            .await
            .unwrap();
        // The log exists (not missing) but holds nothing yet.
        assert_eq!(q.read_chunks("s1", 0).await.unwrap(), Vec::<String>::new());
        assert_eq!(q.streams.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn chunks_read_from_offset_in_append_order() {
        let q = queue();
        q.push_chunk("s1", "a").await.unwrap();
        q.push_chunk("s1", "b").await.unwrap();
        q.push_chunk("s1", "c").await.unwrap();

        assert_eq!(q.read_chunks("s1", 0).await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(q.read_chunks("s1", 1).await.unwrap(), vec!["b", "c"]);
        assert_eq!(q.read_chunks("s1", 3).await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn missing_log_reads_empty() {
        let q = queue();
        assert_eq!(q.read_chunks("ghost", 0).await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn hello_then_done() {
        let q = queue();
        q.push_chunk("s1", "hello").await.unwrap();
        q.mark_done("s1").await.unwrap();

        let chunks = q.read_chunks("s1", 0).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "hello");
        assert_eq!(Sentinel::decode(&chunks[1]), Some(Sentinel::Done));
    }

    #[tokio::test]
    async fn payload_cannot_spoof_sentinel() {
        let q = queue();
        assert!(q.push_chunk("s1", "\u{0}done").await.is_err());
    }

    #[tokio::test]
    async fn cleanup_removes_log() {
        let q = queue();
        q.push_chunk("s1", "x").await.unwrap();
        q.cleanup("s1").await.unwrap();
        assert_eq!(q.read_chunks("s1", 0).await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn sweep_drops_only_expired() {
        let q = MemoryQueue::new(Duration::from_secs(0));
        q.push_chunk("old", "x").await.unwrap();
        let fresh = MemoryQueue::new(Duration::from_secs(60));
        fresh.push_chunk("new", "y").await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(q.sweep_expired().await, 1);
        assert_eq!(fresh.sweep_expired().await, 0);
    }

    #[tokio::test]
    async fn push_refreshes_ttl() {
        let q = queue();
        q.push_chunk("s1", "a").await.unwrap();
        let first = q.streams.lock().await.get("s1").unwrap().expires_at;
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.push_chunk("s1", "b").await.unwrap();
        let second = q.streams.lock().await.get("s1").unwrap().expires_at;
        assert!(second > first);
    }
}
