//! HTTP surface: task CRUD, trigger endpoints, webhook ingress, health.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

use crate::error::HubError;
use crate::manager::{IngestionManager, WebhookDispatchOutcome};
use crate::model::{PluginRef, Task, Trigger};
use crate::store::TaskPatch;

/// Application state shared across handlers
pub struct AppState {
    pub manager: IngestionManager,
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // ── Task CRUD ────────────────────────────────────────────────────
        .route("/tasks", post(schedule_task).get(list_tasks))
        .route(
            "/tasks/{id}",
            get(get_task).patch(update_task).delete(delete_task),
        )
        .route("/tasks/{id}/enable", post(enable_task))
        .route("/tasks/{id}/disable", post(disable_task))
        .route("/tasks/{id}/run", post(run_task))
        // ── Webhook ingress ──────────────────────────────────────────────
        .route("/hooks/{endpoint_id}", post(handle_webhook))
        // ── External cron tick ───────────────────────────────────────────
        .route("/cron/tick", post(cron_tick))
        // ── Health check ─────────────────────────────────────────────────
        .route("/health", get(health_check))
        .with_state(state)
}

// ── Task CRUD ───────────────────────────────────────────────────────────

async fn schedule_task(
    State(state): State<Arc<AppState>>,
    Json(definition): Json<Task>,
) -> Result<Response, HubError> {
    let task = state.manager.schedule_task(definition).await?;
    Ok((StatusCode::CREATED, Json(task)).into_response())
}

async fn list_tasks(State(state): State<Arc<AppState>>) -> Result<Response, HubError> {
    let tasks = state.manager.list_tasks().await?;
    Ok(Json(tasks).into_response())
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, HubError> {
    let task = state.manager.get_task(&id).await?;
    Ok(Json(task).into_response())
}

/// User-settable task fields. Machine-owned state (`currentStatus`,
/// `lastRun`, `lastRunStatus`) is rejected rather than silently ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct TaskUpdateRequest {
    name: Option<String>,
    enabled: Option<bool>,
    source: Option<PluginRef>,
    destination: Option<PluginRef>,
    trigger: Option<Trigger>,
}

impl From<TaskUpdateRequest> for TaskPatch {
    fn from(request: TaskUpdateRequest) -> Self {
        TaskPatch {
            name: request.name,
            enabled: request.enabled,
            source: request.source,
            destination: request.destination,
            trigger: request.trigger,
            ..Default::default()
        }
    }
}

async fn update_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<TaskUpdateRequest>,
) -> Result<Response, HubError> {
    let task = state.manager.update_task(&id, request.into()).await?;
    Ok(Json(task).into_response())
}

async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, HubError> {
    state.manager.delete_task(&id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn enable_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, HubError> {
    let task = state.manager.enable_task(&id).await?;
    Ok(Json(task).into_response())
}

async fn disable_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, HubError> {
    let task = state.manager.disable_task(&id).await?;
    Ok(Json(task).into_response())
}

// ── Triggers ────────────────────────────────────────────────────────────

async fn run_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response, HubError> {
    // An optional JSON body becomes the run's webhook payload, letting
    // operators re-drive a delta sync by hand.
    let payload = if body.is_empty() {
        None
    } else {
        Some(
            serde_json::from_slice(&body)
                .map_err(|e| HubError::InvalidPayload(format!("request body: {e}")))?,
        )
    };

    let status = state.manager.trigger_manual(&id, payload).await?;
    Ok(Json(status).into_response())
}

async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    Path(endpoint_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HubError> {
    info!(endpoint_id = %endpoint_id, bytes = body.len(), "webhook event received");

    let outcome = state
        .manager
        .trigger_webhook(&endpoint_id, &headers, &body)
        .await?;

    let body = match outcome {
        WebhookDispatchOutcome::NoSubscription => serde_json::json!({
            "status": "ignored",
            "reason": "no subscription for resource",
        }),
        WebhookDispatchOutcome::NoTaskMatched => serde_json::json!({
            "status": "ignored",
            "reason": "no task matched",
        }),
        WebhookDispatchOutcome::Dispatched {
            first_status,
            fanned_out,
        } => serde_json::json!({
            "status": "processed",
            "fannedOut": fanned_out,
            "firstStatus": first_status,
        }),
    };
    Ok(Json(body).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct CronTickRequest {
    time: Option<DateTime<Utc>>,
}

async fn cron_tick(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, HubError> {
    let tick: CronTickRequest = if body.is_empty() {
        CronTickRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| HubError::InvalidPayload(format!("request body: {e}")))?
    };

    let fired = state.manager.trigger_all_due_cron_tasks(tick.time).await?;
    Ok(Json(serde_json::json!({ "fired": fired })).into_response())
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health_check(State(state): State<Arc<AppState>>) -> Result<Response, HubError> {
    let tasks = state.manager.list_tasks().await?;
    let enabled = tasks.iter().filter(|t| t.enabled).count();
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "tasks": tasks.len(),
        "enabledTasks": enabled,
    }))
    .into_response())
}
