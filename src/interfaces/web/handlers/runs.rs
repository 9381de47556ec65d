use axum::{
    Json,
    extract::{Path, State},
    http::HeaderMap,
};
use serde_json::{Value, json};
use uuid::Uuid;

use super::super::AppState;
use super::{owner_from, run_json};
use crate::core::gate::PermissionMode;
use crate::core::run::NewRun;
use crate::core::sandbox::SandboxMode;
use crate::core::store::types::{ScheduleMode, SessionKind};

#[derive(serde::Deserialize)]
pub struct EnqueueRunRequest {
    prompt: String,
    #[serde(default)]
    session_id: Option<Uuid>,
    #[serde(default)]
    config: Option<Value>,
    #[serde(default)]
    permission_mode: Option<String>,
    #[serde(default)]
    container_mode: Option<String>,
}

/// Enqueue an immediate run: resolve or create the session, record the user
/// message, create the queued run, and hand it to the engine.
pub async fn enqueue_run_endpoint(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<EnqueueRunRequest>,
) -> Json<serde_json::Value> {
    let owner = owner_from(&headers, &state);

    let prompt = payload.prompt.trim().to_string();
    if prompt.is_empty() {
        return Json(json!({ "success": false, "error": "prompt cannot be empty" }));
    }

    let config = payload.config.unwrap_or_else(|| json!({}));
    let container_mode = payload
        .container_mode
        .as_deref()
        .and_then(SandboxMode::parse)
        .unwrap_or(SandboxMode::Ephemeral);

    let session = match payload.session_id {
        Some(session_id) => match state.store.get_session(session_id).await {
            Ok(Some(session)) if session.owner_id == owner => session,
            Ok(_) => {
                return Json(json!({
                    "success": false,
                    "error": format!("session not found: {session_id}")
                }));
            }
            Err(e) => {
                return Json(json!({ "success": false, "error": e.to_string() }));
            }
        },
        None => {
            match state
                .store
                .create_session(&owner, SessionKind::Chat, config.clone(), container_mode)
                .await
            {
                Ok(session) => session,
                Err(e) => {
                    return Json(json!({ "success": false, "error": e.to_string() }));
                }
            }
        }
    };

    if let Err(e) = state.store.reset_session_for_run(session.id).await {
        return Json(json!({ "success": false, "error": e.to_string() }));
    }

    let content = json!({
        "role": "user",
        "content": [{"type": "text", "text": prompt}],
    });
    let message = match state
        .store
        .create_message(session.id, "user", content, &prompt)
        .await
    {
        Ok(message) => message,
        Err(e) => {
            return Json(json!({ "success": false, "error": e.to_string() }));
        }
    };

    let permission_mode = PermissionMode::parse(payload.permission_mode.as_deref().unwrap_or(""));
    let run = match state
        .lifecycle
        .create_run(NewRun {
            session_id: session.id,
            schedule_mode: ScheduleMode::Immediate,
            scheduled_at: None,
            permission_mode,
            config_snapshot: Some(config),
            user_message_id: Some(message.id),
            scheduled_task_id: None,
        })
        .await
    {
        Ok(run) => run,
        Err(e) => {
            return Json(json!({ "success": false, "error": e.to_string() }));
        }
    };

    match state.engine.clone().submit_run(run.id).await {
        Ok(ack) => Json(json!({
            "success": true,
            "status": "accepted",
            "run_id": ack.run_id,
            "session_id": ack.session_id,
        })),
        Err(e) => Json(json!({ "success": false, "error": e.to_string() })),
    }
}

pub async fn get_run_endpoint(
    Path(run_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    match state.store.get_run(run_id).await {
        Ok(Some(run)) => Json(json!({ "success": true, "run": run_json(&run) })),
        Ok(None) => Json(json!({
            "success": false,
            "error": format!("run not found: {run_id}")
        })),
        Err(e) => Json(json!({ "success": false, "error": e.to_string() })),
    }
}

/// Hard stop: sandbox teardown and a canceled terminal status.
pub async fn cancel_run_endpoint(
    Path(run_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    match state.engine.cancel_run(run_id).await {
        Ok(()) => Json(json!({ "success": true, "message": "Run canceled" })),
        Err(e) => Json(json!({ "success": false, "error": e.to_string() })),
    }
}
