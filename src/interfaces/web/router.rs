use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::auth;
use super::handlers::{requests, runs, sandboxes, tasks};

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/tasks",
            get(tasks::list_tasks_endpoint).post(tasks::create_task_endpoint),
        )
        .route(
            "/api/tasks/{task_id}",
            get(tasks::get_task_endpoint)
                .patch(tasks::update_task_endpoint)
                .delete(tasks::delete_task_endpoint),
        )
        .route(
            "/api/tasks/{task_id}/trigger",
            post(tasks::trigger_task_endpoint),
        )
        .route("/api/dispatch/tick", post(tasks::dispatch_tick_endpoint))
        .route("/api/runs", post(runs::enqueue_run_endpoint))
        .route("/api/runs/{run_id}", get(runs::get_run_endpoint))
        .route("/api/runs/{run_id}/cancel", post(runs::cancel_run_endpoint))
        .route(
            "/api/sessions/{session_id}/requests",
            get(requests::list_requests_endpoint),
        )
        .route(
            "/api/requests/{request_id}/answer",
            post(requests::answer_request_endpoint),
        )
        .route("/api/sandboxes", get(sandboxes::sandbox_stats_endpoint))
        .route(
            "/api/sandboxes/{container_id}",
            axum::routing::delete(sandboxes::force_delete_endpoint),
        )
        .route("/api/logs", get(super::sse_logs_endpoint))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ))
        .layer(middleware::from_fn(security_headers))
        .layer(build_localhost_cors(state.api_port))
        .with_state(state)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    response
}
