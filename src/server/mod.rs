//! HTTP surface: chat dispatch, stream attachment, execution status,
//! task management, and the external cron tick.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tracing::warn;
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::error::SchedulerError;
use crate::queue::{Job, JobKind, JobQueue};
use crate::registry::ExecutionRegistry;
use crate::relay::{RelayEvent, StreamRelay};
use crate::scheduler::Scheduler;
use crate::store::{Datastore, Execution};

const RELAY_BUFFER: usize = 64;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn Datastore>,
    pub scheduler: Arc<Scheduler>,
    pub registry: Arc<ExecutionRegistry>,
    pub relay: RelayConfig,
    pub cron_secret: Option<String>,
}

/// Build the router.
pub fn router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/chat", post(post_chat))
        .route("/chat/{id}/stream", get(get_chat_stream))
        .route("/executions/{id}", get(get_execution))
        .route("/tasks", post(post_task))
        .route("/cron/tick", post(post_cron_tick))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    session_id: Option<String>,
    /// Link this chat to a scheduled task's history.
    #[serde(default)]
    task_id: Option<Uuid>,
}

/// Dispatch a chat job and stream its output live.
async fn post_chat(State(state): State<AppState>, Json(body): Json<ChatRequest>) -> Response {
    let execution = Execution::new(body.message.clone(), body.task_id);
    if let Err(e) = state.store.create_execution(&execution).await {
        warn!("Failed to record chat execution: {e}");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    let stream_id = execution.id.to_string();
    state.registry.insert(execution.id, stream_id.clone()).await;

    let payload = json!({
        "prompt": body.message,
        "session_id": body.session_id,
        "execution_id": execution.id,
    });
    if let Err(e) = state
        .queue
        .enqueue(Job::new(JobKind::Chat, stream_id.clone(), payload))
        .await
    {
        warn!("Failed to enqueue chat job: {e}");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    relay_sse(&state, stream_id, 0)
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    #[serde(default)]
    offset: usize,
}

/// Attach (or reattach) to an execution's output stream.
///
/// An unknown or already-swept stream returns 204: the log is gone, the
/// client should fall back to the execution's stored result.
async fn get_chat_stream(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let stream_id = id.to_string();
    match state.queue.read_chunks(&stream_id, 0).await {
        Ok(chunks) if chunks.is_empty() => {
            // Distinguishing "no chunks yet" from "swept" isn't possible
            // from the log alone; a still-registered execution means the
            // run is in flight, so keep the stream open.
            if state.registry.get(id).await.is_none() {
                return StatusCode::NO_CONTENT.into_response();
            }
        }
        Ok(_) => {}
        Err(e) => {
            warn!(stream_id, "Stream read failed: {e}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    relay_sse(&state, stream_id, query.offset)
}

/// Spawn a relay session and wrap it as an SSE response.
fn relay_sse(state: &AppState, stream_id: String, offset: usize) -> Response {
    let relay = Arc::new(StreamRelay::new(state.queue.clone(), state.relay.clone()));
    let rx = relay.attach(stream_id, offset, RELAY_BUFFER);

    let stream = ReceiverStream::new(rx).map(move |event| {
        Ok::<_, Infallible>(match event {
            RelayEvent::Chunk(chunk) => Event::default().data(chunk),
            RelayEvent::Failed(message) => Event::default().event("error").data(message),
        })
    });

    Sse::new(stream).into_response()
}

/// Execution status: registry first (cheap, in-flight), then the store.
async fn get_execution(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    if let Some(entry) = state.registry.get(id).await {
        // The run may have finished since dispatch; prefer the stored row.
        if let Ok(execution) = state.store.get_execution(id).await {
            return Json(execution).into_response();
        }
        return Json(json!({
            "id": entry.execution_id,
            "status": "running",
            "started_at": entry.started_at,
        }))
        .into_response();
    }

    match state.store.get_execution(id).await {
        Ok(execution) => Json(execution).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct TaskRequest {
    cron: String,
    #[serde(default = "default_timezone")]
    timezone: String,
    prompt: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Create a scheduled task.
async fn post_task(State(state): State<AppState>, Json(body): Json<TaskRequest>) -> Response {
    match state
        .scheduler
        .create_task(&body.cron, &body.timezone, &body.prompt)
        .await
    {
        Ok(task) => (StatusCode::CREATED, Json(task)).into_response(),
        Err(e @ SchedulerError::InvalidCron { .. })
        | Err(e @ SchedulerError::UnknownTimezone(_)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
        Err(e) => {
            warn!("Task creation failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// External cron tick, guarded by a shared secret. With no secret
/// configured the endpoint is disabled outright.
async fn post_cron_tick(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(expected) = state.cron_secret.as_deref() else {
        return StatusCode::FORBIDDEN.into_response();
    };
    let provided = headers
        .get("x-cron-secret")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if provided != expected {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    match state.scheduler.tick(Utc::now()).await {
        Ok(fired) => Json(json!({"fired": fired})).into_response(),
        Err(e) => {
            warn!("Cron tick failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
