use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::json;

use super::super::AppState;

pub async fn sandbox_stats_endpoint(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.pool.stats().await;
    Json(json!({
        "success": true,
        "total_active": stats.total_active,
        "ephemeral_containers": stats.ephemeral,
        "persistent_containers": stats.persistent,
        "containers": stats.containers,
    }))
}

/// Unconditional teardown, used against stuck or abandoned containers.
pub async fn force_delete_endpoint(
    Path(container_id): Path<String>,
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    state.pool.force_delete(&container_id).await;
    Json(json!({ "success": true, "message": "Sandbox deleted" }))
}
