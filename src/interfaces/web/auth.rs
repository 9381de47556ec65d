use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::AppState;

/// Internal-token auth. Trusted callers present the shared token; without
/// one, access is only open when the API is bound to loopback.
pub async fn require_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if let Some(header) = req.headers().get("x-drydock-internal-token") {
        if let Ok(value) = header.to_str() {
            if value == state.internal_token {
                return next.run(req).await;
            }
        }
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Invalid internal token" })),
        )
            .into_response();
    }

    let is_loopback = state.api_host == "127.0.0.1"
        || state.api_host == "::1"
        || state.api_host == "localhost";
    if is_loopback {
        return next.run(req).await;
    }

    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "error": "Missing x-drydock-internal-token header on a non-loopback bind"
        })),
    )
        .into_response()
}
