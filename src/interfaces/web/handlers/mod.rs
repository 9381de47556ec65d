pub(crate) mod requests;
pub(crate) mod runs;
pub(crate) mod sandboxes;
pub(crate) mod tasks;

use axum::http::HeaderMap;
use serde_json::{Value, json};

use super::AppState;
use crate::core::store::types::{PermissionRequestRecord, RunRecord, ScheduledTaskRecord};

/// Callers may scope requests to an owner; everything else falls back to the
/// daemon's configured default.
pub(crate) fn owner_from(headers: &HeaderMap, state: &AppState) -> String {
    headers
        .get("x-drydock-owner")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| state.default_owner.clone())
}

pub(crate) fn task_json(task: &ScheduledTaskRecord) -> Value {
    json!({
        "id": task.id,
        "name": task.name,
        "cron": task.cron,
        "timezone": task.timezone,
        "prompt": task.prompt,
        "enabled": task.enabled,
        "reuse_session": task.reuse_session,
        "session_id": task.session_id,
        "next_fire_at": task.next_fire_at.to_rfc3339(),
        "last_run_id": task.last_run_id,
        "last_run_status": task.last_run_status,
        "last_error": task.last_error,
        "created_at": task.created_at.to_rfc3339(),
    })
}

pub(crate) fn run_json(run: &RunRecord) -> Value {
    json!({
        "id": run.id,
        "session_id": run.session_id,
        "status": run.status.as_str(),
        "schedule_mode": run.schedule_mode.as_str(),
        "scheduled_at": run.scheduled_at.map(|at| at.to_rfc3339()),
        "permission_mode": run.permission_mode.as_str(),
        "scheduled_task_id": run.scheduled_task_id,
        "progress": run.progress,
        "error": run.error,
        "created_at": run.created_at.to_rfc3339(),
        "started_at": run.started_at.map(|at| at.to_rfc3339()),
        "finished_at": run.finished_at.map(|at| at.to_rfc3339()),
    })
}

pub(crate) fn request_json(request: &PermissionRequestRecord) -> Value {
    json!({
        "id": request.id,
        "session_id": request.session_id,
        "run_id": request.run_id,
        "tool_name": request.tool_name,
        "tool_input": request.tool_input,
        "status": request.status.as_str(),
        "created_at": request.created_at.to_rfc3339(),
        "expires_at": request.expires_at.to_rfc3339(),
    })
}
