use std::sync::Arc;
use std::time::Duration;

use conveyor::compaction::ContextCompactor;
use conveyor::config::{AppConfig, RunMode};
use conveyor::llm::{AnthropicProvider, LlmProvider};
use conveyor::queue::{self, JobQueue, LibSqlQueue, MemoryQueue};
use conveyor::registry::{self, ExecutionRegistry};
use conveyor::scheduler::{self, Scheduler};
use conveyor::server::{AppState, router};
use conveyor::store::{Datastore, LibSqlBackend};
use conveyor::tools::ToolRegistry;
use conveyor::tools::builtin::{HttpConnectorTool, ReportSaveTool, ScrapeTool, WebSearchTool};
use conveyor::worker::{Worker, WorkerDeps, spawn_worker};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env()?;

    // Read API key from environment
    let api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_else(|_| {
        eprintln!("Error: ANTHROPIC_API_KEY not set");
        eprintln!("  export ANTHROPIC_API_KEY=sk-ant-...");
        std::process::exit(1);
    });
    let model =
        std::env::var("CONVEYOR_MODEL").unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string());
    let compact_model = std::env::var("CONVEYOR_COMPACT_MODEL")
        .unwrap_or_else(|_| "claude-3-5-haiku-latest".to_string());

    eprintln!("⚙ Conveyor v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {model} (compaction: {compact_model})");
    eprintln!("   Mode: {:?}", config.mode);

    // ── Datastore ────────────────────────────────────────────────────────
    let store: Arc<dyn Datastore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {e}",
                    config.db_path.display()
                );
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Queue ────────────────────────────────────────────────────────────
    // The durable queue shares the deployment's data directory. Worker
    // mode is useless without it; serve mode degrades to an in-process
    // queue with an embedded worker so chats still function single-node.
    let queue_path = config.db_path.with_extension("queue.db");
    let mut force_embedded_worker = false;
    let queue: Arc<dyn JobQueue> =
        match LibSqlQueue::new_local(&queue_path, config.queue.stream_ttl).await {
            Ok(durable) => {
                let durable = Arc::new(durable);
                let _sweep = queue::libsql::spawn_ttl_sweep(
                    Arc::clone(&durable),
                    config.queue.sweep_interval,
                );
                eprintln!("   Queue: {}", queue_path.display());
                durable
            }
            Err(e) if config.mode == RunMode::Work => {
                eprintln!("Error: queue store unavailable in work mode: {e}");
                std::process::exit(1);
            }
            Err(e) => {
                tracing::warn!("Queue store unavailable, degrading to in-process queue: {e}");
                eprintln!("   Queue: in-memory (degraded single-node mode)");
                force_embedded_worker = true;
                let memory = Arc::new(MemoryQueue::new(config.queue.stream_ttl));
                let _sweep =
                    queue::memory::spawn_ttl_sweep(Arc::clone(&memory), config.queue.sweep_interval);
                memory
            }
        };

    // ── LLM providers ────────────────────────────────────────────────────
    let llm: Arc<dyn LlmProvider> = Arc::new(AnthropicProvider::new(
        secrecy::SecretString::from(api_key.clone()),
        model,
    ));
    let compact_llm: Arc<dyn LlmProvider> = Arc::new(AnthropicProvider::new(
        secrecy::SecretString::from(api_key),
        compact_model,
    ));

    // ── Tools ────────────────────────────────────────────────────────────
    let tools = Arc::new(ToolRegistry::new());
    let http = reqwest::Client::new();
    tools.register(Arc::new(ScrapeTool::new(http.clone()))).await;
    tools
        .register(Arc::new(ReportSaveTool::new(Arc::clone(&store))))
        .await;
    if let Ok(endpoint) = std::env::var("CONVEYOR_SEARCH_ENDPOINT") {
        tools
            .register(Arc::new(WebSearchTool::new(http.clone(), endpoint)))
            .await;
    }
    if let Ok(endpoint) = std::env::var("CONVEYOR_MESSAGING_ENDPOINT") {
        tools
            .register(Arc::new(HttpConnectorTool::messaging_send(
                http.clone(),
                endpoint,
            )))
            .await;
    }
    if let Ok(endpoint) = std::env::var("CONVEYOR_EMAIL_ENDPOINT") {
        tools
            .register(Arc::new(HttpConnectorTool::email_read(http.clone(), endpoint)))
            .await;
    }
    if let Ok(endpoint) = std::env::var("CONVEYOR_SANDBOX_ENDPOINT") {
        tools
            .register(Arc::new(HttpConnectorTool::sandbox_exec(http, endpoint)))
            .await;
    }
    eprintln!("   Tools: {} registered", tools.count());

    // ── Scheduler ────────────────────────────────────────────────────────
    let sched = Arc::new(Scheduler::new(Arc::clone(&store), Arc::clone(&queue)));
    if config.mode.serves_http() {
        let _ticker = scheduler::spawn_ticker(Arc::clone(&sched), config.tick_interval);
        eprintln!(
            "   Scheduler: internal ticker every {}s",
            config.tick_interval.as_secs()
        );
    }

    // ── Worker ───────────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    if config.mode.runs_worker() || force_embedded_worker {
        let compactor = Arc::new(ContextCompactor::new(compact_llm, config.compaction.clone()));
        let deps = WorkerDeps {
            queue: Arc::clone(&queue),
            store: Arc::clone(&store),
            llm,
            tools: Arc::clone(&tools),
            compactor,
        };
        let _worker = spawn_worker(Worker::new(deps, config.worker.clone()), shutdown_rx.clone());
        eprintln!("   Worker: running");
    }

    // ── HTTP server ──────────────────────────────────────────────────────
    if config.mode.serves_http() {
        let execution_registry = Arc::new(ExecutionRegistry::new(Duration::from_secs(3600)));
        let _prune =
            registry::spawn_prune_task(Arc::clone(&execution_registry), Duration::from_secs(300));

        let state = AppState {
            queue,
            store,
            scheduler: sched,
            registry: execution_registry,
            relay: config.relay.clone(),
            cron_secret: config.cron_secret.clone(),
        };

        let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
        eprintln!("   HTTP: http://{}\n", config.bind_addr);
        axum::serve(listener, router(state))
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;
    } else {
        // Worker-only process: block until interrupted.
        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutdown signal received");
    }

    let _ = shutdown_tx.send(true);
    Ok(())
}
