//! Task REST API.

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use drover_core::ids::{IdentityId, TaskId};
use drover_core::machine::{MachineId, SystemInfo};
use drover_engine::EngineError;
use drover_store::StoreError;

use crate::server::AppState;

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

fn engine_error_response(e: EngineError) -> Response {
    match e {
        EngineError::Store(StoreError::NotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, "task not found")
        }
        EngineError::Terminal(_) => error_response(StatusCode::CONFLICT, "task already finished"),
        EngineError::Reasoning(ref inner) => {
            error!(error = %inner, "reasoning backend unavailable");
            error_response(StatusCode::BAD_GATEWAY, "reasoning backend unavailable")
        }
        other => {
            error!(error = %other, "request failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

/// Resolve the bearer token to an identity, or fail the request with 401.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<IdentityId, Response> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .and_then(|token| state.tokens.verify(token))
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "invalid or missing access token"))
}

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    prompt: String,
    machine_id: String,
}

/// Decompose a prompt into a task for a machine and start executing it.
pub async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateTaskRequest>,
) -> Response {
    let identity = match authorize(&state, &headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };

    let machine_id = MachineId::from_raw(request.machine_id);
    let machine = match state.machines.get(&machine_id) {
        Ok(machine) if machine.is_active => machine,
        Ok(_) | Err(StoreError::NotFound(_)) => {
            return error_response(StatusCode::NOT_FOUND, "machine not found or inactive");
        }
        Err(e) => {
            error!(error = %e, "machine lookup failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };

    let system_info = SystemInfo {
        os: machine.os,
        arch: machine.arch,
        hostname: machine.hostname,
    };

    let plan = match state.reasoning.decompose(&request.prompt, &system_info).await {
        Ok(plan) => plan,
        Err(e) => {
            error!(error = %e, "decomposition failed");
            return error_response(StatusCode::BAD_GATEWAY, "reasoning backend unavailable");
        }
    };

    let task = match state.dispatcher.lifecycle().create(
        identity,
        machine_id,
        &request.prompt,
        plan.into_subtasks(),
    ) {
        Ok(task) => task,
        Err(e) => return engine_error_response(e),
    };

    let dispatched = match state.dispatcher.start_task(&task.id).await {
        Ok(dispatched) => dispatched,
        Err(e) => return engine_error_response(e),
    };

    Json(json!({
        "task_id": task.id,
        "status": "running",
        "dispatched": dispatched,
        "subtasks": task.subtasks,
    }))
    .into_response()
}

#[derive(Deserialize)]
pub struct Page {
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default)]
    offset: u32,
}

fn default_limit() -> u32 {
    20
}

/// List the identity's tasks, newest first.
pub async fn list_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(page): Query<Page>,
) -> Response {
    let identity = match authorize(&state, &headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };

    match state
        .dispatcher
        .lifecycle()
        .repo()
        .list(&identity, page.limit, page.offset)
    {
        Ok(tasks) => {
            let summaries: Vec<_> = tasks
                .iter()
                .map(|task| {
                    json!({
                        "task_id": task.id,
                        "request": task.request,
                        "status": task.status,
                        "machine_id": task.machine_id,
                        "created_at": task.created_at,
                        "completed_at": task.completed_at,
                        "current_subtask_index": task.current_subtask_index,
                        "total_subtasks": task.subtasks.len(),
                    })
                })
                .collect();
            Json(summaries).into_response()
        }
        Err(e) => {
            error!(error = %e, "task list failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

/// Full task record, including subtasks and attempt history.
pub async fn get_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Response {
    let identity = match authorize(&state, &headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };

    let task_id = TaskId::from_raw(task_id);
    match state
        .dispatcher
        .lifecycle()
        .repo()
        .get_for_identity(&task_id, &identity)
    {
        Ok(task) => Json(task).into_response(),
        Err(StoreError::NotFound(_)) => error_response(StatusCode::NOT_FOUND, "task not found"),
        Err(e) => {
            error!(error = %e, "task fetch failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

/// Compact progress view of one task.
pub async fn task_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Response {
    let identity = match authorize(&state, &headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };

    let task_id = TaskId::from_raw(task_id);
    match state
        .dispatcher
        .lifecycle()
        .repo()
        .get_for_identity(&task_id, &identity)
    {
        Ok(task) => Json(json!({
            "task_id": task.id,
            "status": task.status,
            "current_subtask_index": task.current_subtask_index,
            "total_subtasks": task.subtasks.len(),
            "error_message": task.error_message,
        }))
        .into_response(),
        Err(StoreError::NotFound(_)) => error_response(StatusCode::NOT_FOUND, "task not found"),
        Err(e) => {
            error!(error = %e, "task status failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

/// Cancel a pending or running task.
pub async fn cancel_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Response {
    let identity = match authorize(&state, &headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };

    let task_id = TaskId::from_raw(task_id);
    match state.dispatcher.cancel(&task_id, &identity).await {
        Ok(true) => Json(json!({"message": "task cancelled"})).into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "task not found or cannot be cancelled"),
        Err(e) => engine_error_response(e),
    }
}

/// Regenerate and broadcast the summary of a finished task.
pub async fn generate_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Response {
    let identity = match authorize(&state, &headers) {
        Ok(identity) => identity,
        Err(response) => return response,
    };

    let task_id = TaskId::from_raw(task_id);
    match state.dispatcher.regenerate_summary(&task_id, &identity).await {
        Ok(summary) => Json(json!({"summary": summary})).into_response(),
        Err(EngineError::Internal(_)) => {
            error_response(StatusCode::BAD_REQUEST, "task must be finished before summarizing")
        }
        Err(e) => engine_error_response(e),
    }
}

/// Liveness probe.
pub async fn health(State(state): State<AppState>) -> Response {
    Json(json!({
        "status": "healthy",
        "machines_connected": state.registry.machine_count(),
    }))
    .into_response()
}
