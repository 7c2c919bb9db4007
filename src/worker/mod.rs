//! Worker: pulls jobs off the queue and drives the agent loop.
//!
//! One job at a time per worker. Each step the worker compacts the
//! window if needed, calls the model (with retries), streams assistant
//! text into the chunk log, and either finishes (no tool calls) or
//! executes the requested tools and loops. Every terminal path appends
//! exactly one sentinel and completes the Execution row.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::compaction::ContextCompactor;
use crate::config::WorkerConfig;
use crate::error::LlmError;
use crate::llm::{
    ChatMessage, CompletionRequest, CompletionResponse, LlmProvider, ToolCall,
};
use crate::queue::{Job, JobQueue};
use crate::store::{Datastore, Execution, ExecutionStatus};
use crate::tools::ToolRegistry;

/// Shared dependencies for worker execution.
#[derive(Clone)]
pub struct WorkerDeps {
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn Datastore>,
    pub llm: Arc<dyn LlmProvider>,
    pub tools: Arc<ToolRegistry>,
    pub compactor: Arc<ContextCompactor>,
}

/// Queue-polling agent worker.
pub struct Worker {
    deps: WorkerDeps,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(deps: WorkerDeps, config: WorkerConfig) -> Self {
        Self { deps, config }
    }

    /// Poll the queue until `shutdown` flips. Queue errors back off
    /// rather than kill the loop.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(model = self.deps.llm.model_name(), "Worker started");
        loop {
            if *shutdown.borrow() {
                info!("Worker shutting down");
                return;
            }

            let job = tokio::select! {
                polled = self.deps.queue.poll() => polled,
                _ = shutdown.changed() => continue,
            };

            match job {
                Ok(Some(job)) => {
                    let job_id = job.id;
                    if let Err(e) = self.execute(&job).await {
                        error!(job_id = %job_id, "Job execution failed: {e}");
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    warn!("Queue poll failed, backing off: {e}");
                    tokio::time::sleep(self.config.poll_interval * 4).await;
                }
            }
        }
    }

    /// Run one job to a terminal sentinel.
    pub async fn execute(&self, job: &Job) -> crate::error::Result<()> {
        let prompt = job
            .payload
            .get("prompt")
            .or_else(|| job.payload.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        // Scheduler-fired jobs carry their execution id; ad-hoc jobs get
        // a fresh row here.
        let execution_id = match job
            .payload
            .get("execution_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
        {
            Some(id) => id,
            None => {
                let execution = Execution::new(prompt.clone(), None);
                self.deps.store.create_execution(&execution).await?;
                execution.id
            }
        };

        info!(job_id = %job.id, execution_id = %execution_id, "Job started");

        let mut window = vec![
            ChatMessage::system(self.config.system_prompt.clone()),
            ChatMessage::user(prompt),
        ];
        let mut last_input_tokens = 0;
        let tools = self.deps.tools.tool_definitions().await;

        for step in 0..self.config.max_steps {
            if self.deps.compactor.needs_compaction(&window, last_input_tokens) {
                window = self.deps.compactor.compact(window).await;
            }

            let request = CompletionRequest::new(window.clone()).with_tools(tools.clone());
            let response = match self.call_model_with_retry(request).await {
                Ok(response) => response,
                Err(e) => {
                    return self
                        .fail(job, execution_id, &format!("model call failed: {e}"))
                        .await;
                }
            };
            last_input_tokens = response.input_tokens;

            if !response.content.is_empty() {
                if let Err(e) = self
                    .deps
                    .queue
                    .push_chunk(&job.stream_id, &response.content)
                    .await
                {
                    return self
                        .fail(job, execution_id, &format!("stream append failed: {e}"))
                        .await;
                }
            }

            if response.tool_calls.is_empty() {
                if let Err(e) = self.deps.queue.mark_done(&job.stream_id).await {
                    warn!(stream_id = %job.stream_id, "Done sentinel append failed: {e}");
                }
                self.complete(execution_id, ExecutionStatus::Success, &response.content)
                    .await;
                info!(execution_id = %execution_id, steps = step + 1, "Job complete");
                return Ok(());
            }

            debug!(
                execution_id = %execution_id,
                step,
                tools = response.tool_calls.len(),
                "Executing tool calls"
            );
            let results = self.run_tools(&response.tool_calls).await;

            window.push(ChatMessage::assistant_with_tools(
                response.content,
                response.tool_calls.clone(),
            ));
            for (call, result) in response.tool_calls.iter().zip(results) {
                window.push(ChatMessage::tool(result, call.id.clone()));
            }
        }

        self.fail(job, execution_id, "step budget exhausted").await
    }

    /// Execute the step's tool calls in order. Tool failures become tool
    /// messages the model can react to; they never abort the job.
    async fn run_tools(&self, calls: &[ToolCall]) -> Vec<String> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            let result = match self.deps.tools.get(&call.name).await {
                Some(tool) => tool.invoke(call.arguments.clone()).await,
                None => Err(crate::error::ToolError::NotFound {
                    name: call.name.clone(),
                }),
            };
            results.push(match result {
                Ok(output) => output,
                Err(e) => {
                    warn!(tool = %call.name, "Tool call failed: {e}");
                    format!("Error: {e}")
                }
            });
        }
        results
    }

    /// Call the model, retrying transient failures with exponential
    /// backoff. Rate-limit responses honor the server's retry-after.
    async fn call_model_with_retry(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, LlmError> {
        let mut attempt = 0;
        loop {
            match self.deps.llm.complete(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < self.config.model_retries => {
                    let delay = match &e {
                        LlmError::RateLimited {
                            retry_after: Some(after),
                            ..
                        } => *after,
                        _ => Duration::from_millis(500 * (1 << attempt)),
                    };
                    warn!(attempt, "Model call failed, retrying in {delay:?}: {e}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Terminal error path: error sentinel + failed execution row. The
    /// two writes are independent; a failed sentinel append never skips
    /// the Execution update.
    async fn fail(
        &self,
        job: &Job,
        execution_id: Uuid,
        message: &str,
    ) -> crate::error::Result<()> {
        error!(job_id = %job.id, execution_id = %execution_id, "Job failed: {message}");
        if let Err(e) = self.deps.queue.mark_error(&job.stream_id, message).await {
            warn!(stream_id = %job.stream_id, "Error sentinel append failed: {e}");
        }
        self.complete(execution_id, ExecutionStatus::Error, message)
            .await;
        Ok(())
    }

    /// Record the terminal status on the Execution row. The row is the
    /// durable record of the run, so a write failure is logged rather
    /// than propagated.
    async fn complete(&self, execution_id: Uuid, status: ExecutionStatus, result: &str) {
        if let Err(e) = self
            .deps
            .store
            .complete_execution(execution_id, status, Some(result))
            .await
        {
            error!(execution_id = %execution_id, "Failed to record terminal status: {e}");
        }
    }
}

/// Spawn the worker loop as a background task.
pub fn spawn_worker(worker: Worker, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        worker.run(shutdown).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::CompactorConfig;
    use crate::error::{QueueError, ToolError};
    use crate::llm::FinishReason;
    use crate::queue::{JobKind, MemoryQueue, Sentinel};
    use crate::store::LibSqlBackend;
    use crate::tools::Tool;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Mutex;

    /// Plays back a scripted sequence of responses.
    struct ScriptedProvider {
        script: Mutex<Vec<Result<CompletionResponse, LlmError>>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<CompletionResponse, LlmError>>) -> Self {
            Self {
                script: Mutex::new(script),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            self.script.lock().unwrap().remove(0)
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    fn text_response(content: &str) -> CompletionResponse {
        CompletionResponse {
            content: content.to_string(),
            tool_calls: Vec::new(),
            input_tokens: 100,
            output_tokens: 20,
            finish_reason: FinishReason::Stop,
        }
    }

    fn tool_response(content: &str, name: &str) -> CompletionResponse {
        CompletionResponse {
            content: content.to_string(),
            tool_calls: vec![ToolCall {
                id: "c1".to_string(),
                name: name.to_string(),
                arguments: json!({}),
            }],
            input_tokens: 100,
            output_tokens: 20,
            finish_reason: FinishReason::ToolUse,
        }
    }

    struct StaticTool;

    #[async_trait]
    impl Tool for StaticTool {
        fn name(&self) -> &str {
            "lookup"
        }

        fn description(&self) -> &str {
            "Static lookup"
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn invoke(&self, _args: Value) -> Result<String, ToolError> {
            Ok("42".to_string())
        }
    }

    /// Delegates to a real queue but fails selected writes, standing in
    /// for a backend outage at exactly that point.
    struct OutageQueue {
        inner: Arc<MemoryQueue>,
        fail_chunks: bool,
        fail_sentinels: bool,
    }

    impl OutageQueue {
        fn outage() -> QueueError {
            QueueError::Backend("queue store offline".to_string())
        }
    }

    #[async_trait]
    impl JobQueue for OutageQueue {
        async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
            self.inner.enqueue(job).await
        }

        async fn poll(&self) -> Result<Option<Job>, QueueError> {
            self.inner.poll().await
        }

        async fn push_chunk(&self, stream_id: &str, chunk: &str) -> Result<(), QueueError> {
            if self.fail_chunks {
                return Err(Self::outage());
            }
            self.inner.push_chunk(stream_id, chunk).await
        }

        async fn read_chunks(
            &self,
            stream_id: &str,
            from_offset: usize,
        ) -> Result<Vec<String>, QueueError> {
            self.inner.read_chunks(stream_id, from_offset).await
        }

        async fn mark_done(&self, stream_id: &str) -> Result<(), QueueError> {
            if self.fail_sentinels {
                return Err(Self::outage());
            }
            self.inner.mark_done(stream_id).await
        }

        async fn mark_error(&self, stream_id: &str, message: &str) -> Result<(), QueueError> {
            if self.fail_sentinels {
                return Err(Self::outage());
            }
            self.inner.mark_error(stream_id, message).await
        }

        async fn cleanup(&self, stream_id: &str) -> Result<(), QueueError> {
            self.inner.cleanup(stream_id).await
        }
    }

    async fn worker_over(
        queue: Arc<dyn JobQueue>,
        script: Vec<Result<CompletionResponse, LlmError>>,
    ) -> (Worker, Arc<LibSqlBackend>) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let llm = Arc::new(ScriptedProvider::new(script));
        let tools = Arc::new(ToolRegistry::new());
        tools.register(Arc::new(StaticTool)).await;
        let compactor = Arc::new(ContextCompactor::new(
            llm.clone(),
            CompactorConfig::default(),
        ));

        let deps = WorkerDeps {
            queue,
            store: store.clone(),
            llm,
            tools,
            compactor,
        };
        let config = WorkerConfig {
            model_retries: 0,
            ..WorkerConfig::default()
        };
        (Worker::new(deps, config), store)
    }

    async fn worker_with(
        script: Vec<Result<CompletionResponse, LlmError>>,
    ) -> (Worker, Arc<MemoryQueue>, Arc<LibSqlBackend>) {
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        let (worker, store) = worker_over(queue.clone(), script).await;
        (worker, queue, store)
    }

    #[tokio::test]
    async fn plain_answer_streams_and_completes() {
        let (worker, queue, store) =
            worker_with(vec![Ok(text_response("The answer is 42."))]).await;

        let job = Job::new(JobKind::Chat, "s1", json!({"message": "what is the answer?"}));
        worker.execute(&job).await.unwrap();

        let chunks = queue.read_chunks("s1", 0).await.unwrap();
        assert_eq!(chunks[0], "The answer is 42.");
        assert_eq!(Sentinel::decode(&chunks[1]), Some(Sentinel::Done));

        // An execution row was created ad hoc and completed.
        let tasks = store.list_tasks().await.unwrap();
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn tool_loop_feeds_results_back() {
        let (worker, queue, store) = worker_with(vec![
            Ok(tool_response("Let me look that up.", "lookup")),
            Ok(text_response("It is 42.")),
        ])
        .await;

        let execution = Execution::new("find it", None);
        store.create_execution(&execution).await.unwrap();
        let job = Job::new(
            JobKind::Task,
            execution.id.to_string(),
            json!({"prompt": "find it", "execution_id": execution.id}),
        );
        worker.execute(&job).await.unwrap();

        let chunks = queue.read_chunks(&job.stream_id, 0).await.unwrap();
        assert_eq!(chunks[0], "Let me look that up.");
        assert_eq!(chunks[1], "It is 42.");
        assert_eq!(Sentinel::decode(&chunks[2]), Some(Sentinel::Done));

        let done = store.get_execution(execution.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Success);
        assert_eq!(done.result.as_deref(), Some("It is 42."));
    }

    #[tokio::test]
    async fn unknown_tool_becomes_error_message_not_failure() {
        let (worker, queue, _store) = worker_with(vec![
            Ok(tool_response("Trying a tool.", "no_such_tool")),
            Ok(text_response("Worked around it.")),
        ])
        .await;

        let job = Job::new(JobKind::Chat, "s1", json!({"message": "go"}));
        worker.execute(&job).await.unwrap();

        let chunks = queue.read_chunks("s1", 0).await.unwrap();
        assert_eq!(Sentinel::decode(chunks.last().unwrap()), Some(Sentinel::Done));
    }

    #[tokio::test]
    async fn model_failure_marks_error() {
        let (worker, queue, store) = worker_with(vec![Err(LlmError::RequestFailed {
            provider: "scripted".to_string(),
            reason: "boom".to_string(),
        })])
        .await;

        let execution = Execution::new("doomed", None);
        store.create_execution(&execution).await.unwrap();
        let job = Job::new(
            JobKind::Task,
            execution.id.to_string(),
            json!({"prompt": "doomed", "execution_id": execution.id}),
        );
        worker.execute(&job).await.unwrap();

        let chunks = queue.read_chunks(&job.stream_id, 0).await.unwrap();
        match Sentinel::decode(&chunks[0]) {
            Some(Sentinel::Error(message)) => assert!(message.contains("boom")),
            other => panic!("expected error sentinel, got {other:?}"),
        }

        let failed = store.get_execution(execution.id).await.unwrap();
        assert_eq!(failed.status, ExecutionStatus::Error);
    }

    #[tokio::test]
    async fn sentinel_outage_still_fails_execution() {
        let inner = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        let queue = Arc::new(OutageQueue {
            inner,
            fail_chunks: false,
            fail_sentinels: true,
        });
        let (worker, store) = worker_over(
            queue,
            vec![Err(LlmError::RequestFailed {
                provider: "scripted".to_string(),
                reason: "boom".to_string(),
            })],
        )
        .await;

        let execution = Execution::new("doomed", None);
        store.create_execution(&execution).await.unwrap();
        let job = Job::new(
            JobKind::Task,
            execution.id.to_string(),
            json!({"prompt": "doomed", "execution_id": execution.id}),
        );
        worker.execute(&job).await.unwrap();

        // mark_error never landed, but the row must still leave Running.
        let failed = store.get_execution(execution.id).await.unwrap();
        assert_eq!(failed.status, ExecutionStatus::Error);
        assert!(failed.result.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn sentinel_outage_still_records_success() {
        let inner = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        let queue = Arc::new(OutageQueue {
            inner,
            fail_chunks: false,
            fail_sentinels: true,
        });
        let (worker, store) =
            worker_over(queue, vec![Ok(text_response("All done."))]).await;

        let execution = Execution::new("quick", None);
        store.create_execution(&execution).await.unwrap();
        let job = Job::new(
            JobKind::Chat,
            execution.id.to_string(),
            json!({"message": "quick", "execution_id": execution.id}),
        );
        worker.execute(&job).await.unwrap();

        let done = store.get_execution(execution.id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Success);
        assert_eq!(done.result.as_deref(), Some("All done."));
    }

    #[tokio::test]
    async fn chunk_append_failure_ends_job_with_error() {
        let inner = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        let queue = Arc::new(OutageQueue {
            inner: inner.clone(),
            fail_chunks: true,
            fail_sentinels: false,
        });
        let (worker, store) =
            worker_over(queue, vec![Ok(text_response("lost chunk"))]).await;

        let execution = Execution::new("hi", None);
        store.create_execution(&execution).await.unwrap();
        let job = Job::new(
            JobKind::Chat,
            execution.id.to_string(),
            json!({"message": "hi", "execution_id": execution.id}),
        );
        worker.execute(&job).await.unwrap();

        let chunks = inner.read_chunks(&job.stream_id, 0).await.unwrap();
        match Sentinel::decode(&chunks[0]) {
            Some(Sentinel::Error(message)) => assert!(message.contains("stream append failed")),
            other => panic!("expected error sentinel, got {other:?}"),
        }
        let failed = store.get_execution(execution.id).await.unwrap();
        assert_eq!(failed.status, ExecutionStatus::Error);
    }

    #[tokio::test]
    async fn step_budget_exhaustion_is_terminal() {
        // Model asks for a tool forever.
        let script: Vec<_> = (0..3).map(|_| Ok(tool_response("again", "lookup"))).collect();
        let (mut worker, queue, _store) = {
            let (worker, queue, store) = worker_with(script).await;
            (worker, queue, store)
        };
        worker.config.max_steps = 3;

        let job = Job::new(JobKind::Chat, "s1", json!({"message": "loop"}));
        worker.execute(&job).await.unwrap();

        let chunks = queue.read_chunks("s1", 0).await.unwrap();
        match Sentinel::decode(chunks.last().unwrap()) {
            Some(Sentinel::Error(message)) => assert!(message.contains("step budget")),
            other => panic!("expected error sentinel, got {other:?}"),
        }
    }
}
