use axum::{
    Json,
    extract::{Path, State},
    http::HeaderMap,
};
use uuid::Uuid;

use super::super::AppState;
use super::{owner_from, task_json};
use crate::core::dispatch::{CreateTaskRequest, UpdateTaskRequest};

pub async fn list_tasks_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<serde_json::Value> {
    let owner = owner_from(&headers, &state);
    match state.dispatcher.list_tasks(&owner).await {
        Ok(tasks) => {
            let tasks: Vec<_> = tasks.iter().map(task_json).collect();
            Json(serde_json::json!({ "success": true, "tasks": tasks }))
        }
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to list scheduled tasks: {}", e)
        })),
    }
}

pub async fn create_task_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateTaskRequest>,
) -> Json<serde_json::Value> {
    let owner = owner_from(&headers, &state);
    match state.dispatcher.create_task(&owner, payload).await {
        Ok(task) => Json(serde_json::json!({ "success": true, "task": task_json(&task) })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": e.to_string()
        })),
    }
}

pub async fn get_task_endpoint(
    Path(task_id): Path<Uuid>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<serde_json::Value> {
    let owner = owner_from(&headers, &state);
    match state.dispatcher.get_task(&owner, task_id).await {
        Ok(task) => Json(serde_json::json!({ "success": true, "task": task_json(&task) })),
        Err(e) => Json(serde_json::json!({ "success": false, "error": e.to_string() })),
    }
}

pub async fn update_task_endpoint(
    Path(task_id): Path<Uuid>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<UpdateTaskRequest>,
) -> Json<serde_json::Value> {
    let owner = owner_from(&headers, &state);
    match state.dispatcher.update_task(&owner, task_id, payload).await {
        Ok(task) => Json(serde_json::json!({ "success": true, "task": task_json(&task) })),
        Err(e) => Json(serde_json::json!({ "success": false, "error": e.to_string() })),
    }
}

pub async fn delete_task_endpoint(
    Path(task_id): Path<Uuid>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<serde_json::Value> {
    let owner = owner_from(&headers, &state);
    match state.dispatcher.delete_task(&owner, task_id).await {
        Ok(()) => Json(serde_json::json!({ "success": true, "message": "Scheduled task removed" })),
        Err(e) => Json(serde_json::json!({ "success": false, "error": e.to_string() })),
    }
}

/// Force a firing now, bypassing the skip-if-active rule, then hand the run
/// to the execution engine.
pub async fn trigger_task_endpoint(
    Path(task_id): Path<Uuid>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<serde_json::Value> {
    let owner = owner_from(&headers, &state);
    let run = match state.dispatcher.trigger_now(&owner, task_id).await {
        Ok(run) => run,
        Err(e) => {
            return Json(serde_json::json!({ "success": false, "error": e.to_string() }));
        }
    };

    if let Err(e) = state.engine.clone().submit_run(run.id).await {
        return Json(serde_json::json!({
            "success": false,
            "error": format!("Run enqueued but not submitted: {}", e)
        }));
    }

    Json(serde_json::json!({
        "success": true,
        "run_id": run.id,
        "session_id": run.session_id,
    }))
}

/// Operator-invoked dispatcher tick; the internal timer runs the same path.
pub async fn dispatch_tick_endpoint(State(state): State<AppState>) -> Json<serde_json::Value> {
    let summary = state.dispatcher.tick().await;

    for run_id in &summary.run_ids {
        if let Err(e) = state.engine.clone().submit_run(*run_id).await {
            tracing::warn!("Failed to submit dispatched run {}: {}", run_id, e);
        }
    }

    Json(serde_json::json!({
        "success": true,
        "dispatched": summary.dispatched,
        "run_ids": summary.run_ids,
        "skipped": summary.skipped,
        "errors": summary.errors,
    }))
}
