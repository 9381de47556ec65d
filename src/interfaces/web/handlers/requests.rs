use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::{Value, json};
use uuid::Uuid;

use super::super::AppState;
use super::request_json;

/// Pending permission requests for a session, for the human-review surface.
pub async fn list_requests_endpoint(
    Path(session_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    match state.store.list_pending_requests(session_id).await {
        Ok(requests) => {
            let requests: Vec<_> = requests.iter().map(request_json).collect();
            Json(json!({ "success": true, "requests": requests }))
        }
        Err(e) => Json(json!({ "success": false, "error": e.to_string() })),
    }
}

#[derive(serde::Deserialize)]
pub struct AnswerRequest {
    answers: Value,
}

/// Resolve a pending request. The waiting gate sees the answer on its next
/// poll of the shared store — possibly from a different process than the one
/// that accepted this call.
pub async fn answer_request_endpoint(
    Path(request_id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<AnswerRequest>,
) -> Json<serde_json::Value> {
    match state
        .store
        .answer_permission_request(request_id, &payload.answers)
        .await
    {
        Ok(true) => Json(json!({ "success": true, "message": "Answer recorded" })),
        Ok(false) => Json(json!({
            "success": false,
            "error": "Request already answered or expired"
        })),
        Err(e) => Json(json!({ "success": false, "error": e.to_string() })),
    }
}
