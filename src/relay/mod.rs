//! Stream relay: bridges the queue's chunk log to a live subscriber.
//!
//! The relay polls `read_chunks` from a caller-supplied offset, forwards
//! payload chunks over an mpsc channel, and stops on a sentinel. It is a
//! pure reader: a relay failing or its subscriber hanging up never
//! affects the worker writing the log. Resume is just a new relay with a
//! higher offset.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RelayConfig;
use crate::error::StreamError;
use crate::queue::{JobQueue, Sentinel};

/// How a relay session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Saw the Done sentinel.
    Completed,
    /// Saw an Error sentinel or a read failure.
    Failed,
    /// The subscriber hung up.
    Disconnected,
    /// No new chunk within `max_idle`.
    IdleTimeout,
}

/// Event delivered to the subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// An ordinary payload chunk.
    Chunk(String),
    /// The stream ended in error; carries the sentinel message.
    Failed(String),
}

/// Polls one stream log and forwards its chunks.
pub struct StreamRelay {
    queue: Arc<dyn JobQueue>,
    config: RelayConfig,
}

impl StreamRelay {
    pub fn new(queue: Arc<dyn JobQueue>, config: RelayConfig) -> Self {
        Self { queue, config }
    }

    /// Relay `stream_id` from `offset` into `tx` until a sentinel, an
    /// idle timeout, or the subscriber disconnects. Sentinels are
    /// consumed here and never forwarded as chunks.
    pub async fn run(
        &self,
        stream_id: &str,
        mut offset: usize,
        tx: mpsc::Sender<RelayEvent>,
    ) -> RelayOutcome {
        let mut last_progress = Instant::now();

        loop {
            let chunks = match self.queue.read_chunks(stream_id, offset).await {
                Ok(chunks) => chunks,
                Err(e) => {
                    let err = StreamError::ReadFailed {
                        stream_id: stream_id.to_string(),
                        reason: e.to_string(),
                    };
                    warn!("Relay read failed: {err}");
                    let _ = tx.send(RelayEvent::Failed(err.to_string())).await;
                    return RelayOutcome::Failed;
                }
            };

            for chunk in chunks {
                offset += 1;
                last_progress = Instant::now();

                match Sentinel::decode(&chunk) {
                    Some(Sentinel::Done) => {
                        debug!(stream_id, offset, "Relay complete");
                        return RelayOutcome::Completed;
                    }
                    Some(Sentinel::Error(message)) => {
                        let _ = tx.send(RelayEvent::Failed(message)).await;
                        return RelayOutcome::Failed;
                    }
                    None => {
                        if tx.send(RelayEvent::Chunk(chunk)).await.is_err() {
                            // Subscriber gone. The log (and the worker
                            // writing it) outlives this relay.
                            debug!(stream_id, offset, "Relay subscriber disconnected");
                            return RelayOutcome::Disconnected;
                        }
                    }
                }
            }

            if last_progress.elapsed() >= self.config.max_idle {
                warn!(stream_id, offset, "Relay idle timeout");
                return RelayOutcome::IdleTimeout;
            }

            let jitter = rand::thread_rng().gen_range(0..=self.config.max_jitter_ms);
            tokio::time::sleep(self.config.poll_interval + Duration::from_millis(jitter)).await;
        }
    }

    /// Spawn a relay session, returning the subscriber end.
    pub fn attach(
        self: Arc<Self>,
        stream_id: String,
        offset: usize,
        buffer: usize,
    ) -> mpsc::Receiver<RelayEvent> {
        let (tx, rx) = mpsc::channel(buffer);
        tokio::spawn(async move {
            self.run(&stream_id, offset, tx).await;
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use crate::queue::{Job, MemoryQueue};
    use async_trait::async_trait;

    fn relay(queue: Arc<MemoryQueue>) -> StreamRelay {
        let config = RelayConfig {
            poll_interval: Duration::from_millis(5),
            max_jitter_ms: 2,
            max_idle: Duration::from_millis(200),
        };
        StreamRelay::new(queue, config)
    }

    async fn collect(mut rx: mpsc::Receiver<RelayEvent>) -> Vec<RelayEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn forwards_chunks_and_stops_on_done() {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        queue.push_chunk("s1", "hello").await.unwrap();
        queue.push_chunk("s1", " world").await.unwrap();
        queue.mark_done("s1").await.unwrap();

        let relay = Arc::new(relay(queue));
        let rx = relay.attach("s1".to_string(), 0, 16);
        let events = collect(rx).await;

        // Both payload chunks, no sentinel leakage.
        assert_eq!(
            events,
            vec![
                RelayEvent::Chunk("hello".to_string()),
                RelayEvent::Chunk(" world".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn picks_up_chunks_written_after_attach() {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        let relay = Arc::new(relay(queue.clone()));
        let rx = relay.attach("s1".to_string(), 0, 16);

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push_chunk("s1", "late").await.unwrap();
        queue.mark_done("s1").await.unwrap();

        let events = collect(rx).await;
        assert_eq!(events, vec![RelayEvent::Chunk("late".to_string())]);
    }

    #[tokio::test]
    async fn resume_from_offset_replays_identical_suffix() {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        for chunk in ["a", "b", "c"] {
            queue.push_chunk("s1", chunk).await.unwrap();
        }
        queue.mark_done("s1").await.unwrap();

        let relay = Arc::new(relay(queue));
        let full = collect(relay.clone().attach("s1".to_string(), 0, 16)).await;
        let tail = collect(relay.clone().attach("s1".to_string(), 2, 16)).await;

        assert_eq!(full.len(), 3);
        assert_eq!(tail, full[2..].to_vec());

        // Replays are deterministic: same offset, same sequence.
        let again = collect(relay.attach("s1".to_string(), 0, 16)).await;
        assert_eq!(again, full);
    }

    #[tokio::test]
    async fn error_sentinel_surfaces_as_failed() {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        queue.push_chunk("s1", "partial").await.unwrap();
        queue.mark_error("s1", "model call failed").await.unwrap();

        let relay = relay(queue);
        let (tx, rx) = mpsc::channel(16);
        let outcome = relay.run("s1", 0, tx).await;

        assert_eq!(outcome, RelayOutcome::Failed);
        let events = collect(rx).await;
        assert_eq!(
            events,
            vec![
                RelayEvent::Chunk("partial".to_string()),
                RelayEvent::Failed("model call failed".to_string()),
            ]
        );
    }

    struct BrokenQueue;

    #[async_trait]
    impl JobQueue for BrokenQueue {
        async fn enqueue(&self, _job: Job) -> Result<(), QueueError> {
            Ok(())
        }

        async fn poll(&self) -> Result<Option<Job>, QueueError> {
            Ok(None)
        }

        async fn push_chunk(&self, _stream_id: &str, _chunk: &str) -> Result<(), QueueError> {
            Ok(())
        }

        async fn read_chunks(
            &self,
            _stream_id: &str,
            _from_offset: usize,
        ) -> Result<Vec<String>, QueueError> {
            Err(QueueError::Backend("disk gone".to_string()))
        }

        async fn mark_done(&self, _stream_id: &str) -> Result<(), QueueError> {
            Ok(())
        }

        async fn mark_error(&self, _stream_id: &str, _message: &str) -> Result<(), QueueError> {
            Ok(())
        }

        async fn cleanup(&self, _stream_id: &str) -> Result<(), QueueError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn read_failure_surfaces_stream_error_to_subscriber() {
        let relay = StreamRelay::new(Arc::new(BrokenQueue), RelayConfig::default());
        let (tx, rx) = mpsc::channel(16);
        let outcome = relay.run("s1", 0, tx).await;

        assert_eq!(outcome, RelayOutcome::Failed);
        let events = collect(rx).await;
        match events.as_slice() {
            [RelayEvent::Failed(message)] => {
                assert!(message.contains("Failed to read stream s1"));
                assert!(message.contains("disk gone"));
            }
            other => panic!("expected a single failure event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn idle_stream_times_out() {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        let relay = relay(queue);
        let (tx, _rx) = mpsc::channel(16);
        let outcome = relay.run("silent", 0, tx).await;
        assert_eq!(outcome, RelayOutcome::IdleTimeout);
    }

    #[tokio::test]
    async fn subscriber_disconnect_stops_relay_only() {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        queue.push_chunk("s1", "one").await.unwrap();
        queue.push_chunk("s1", "two").await.unwrap();

        let relay = relay(queue.clone());
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let outcome = relay.run("s1", 0, tx).await;
        assert_eq!(outcome, RelayOutcome::Disconnected);

        // The log is untouched; a writer can keep appending.
        queue.push_chunk("s1", "three").await.unwrap();
        assert_eq!(queue.read_chunks("s1", 0).await.unwrap().len(), 3);
    }
}
