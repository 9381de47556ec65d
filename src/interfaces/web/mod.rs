pub(crate) mod auth;
mod handlers;
mod router;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::info;

use crate::core::dispatch::TaskDispatcher;
use crate::core::engine::ExecutionEngine;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::run::RunLifecycle;
use crate::core::sandbox::SandboxPool;
use crate::core::store::StateStore;

pub struct ApiServerConfig {
    pub store: Arc<StateStore>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub lifecycle: Arc<RunLifecycle>,
    pub pool: Arc<SandboxPool>,
    pub engine: Arc<ExecutionEngine>,
    pub log_tx: tokio::sync::broadcast::Sender<String>,
    pub api_host: String,
    pub api_port: u16,
    pub internal_token: String,
    pub default_owner: String,
}

pub struct ApiServer {
    config: ApiServerConfig,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) store: Arc<StateStore>,
    pub(crate) dispatcher: Arc<TaskDispatcher>,
    pub(crate) lifecycle: Arc<RunLifecycle>,
    pub(crate) pool: Arc<SandboxPool>,
    pub(crate) engine: Arc<ExecutionEngine>,
    pub(crate) log_tx: tokio::sync::broadcast::Sender<String>,
    pub(crate) api_host: String,
    pub(crate) api_port: u16,
    pub(crate) internal_token: String,
    pub(crate) default_owner: String,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig) -> Self {
        Self { config }
    }

    fn state(&self) -> AppState {
        AppState {
            store: self.config.store.clone(),
            dispatcher: self.config.dispatcher.clone(),
            lifecycle: self.config.lifecycle.clone(),
            pool: self.config.pool.clone(),
            engine: self.config.engine.clone(),
            log_tx: self.config.log_tx.clone(),
            api_host: self.config.api_host.clone(),
            api_port: self.config.api_port,
            internal_token: self.config.internal_token.clone(),
            default_owner: self.config.default_owner.clone(),
        }
    }
}

// --- SSE Logs (used by router) ---

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| match msg {
        Ok(line) => Ok(Event::default().data(line)),
        Err(_) => Ok(Event::default().data("Log stream lagged")),
    });

    Sse::new(stream)
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API server initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let state = self.state();
        let addr = format!("{}:{}", state.api_host, state.api_port);

        tokio::spawn(async move {
            let app = router::build_api_router(state);
            match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => {
                    info!("API server running at http://{addr}");
                    if let Err(e) = axum::serve(listener, app).await {
                        tracing::error!("API server crashed: {}", e);
                    }
                }
                Err(e) => tracing::error!("API server failed to bind {addr}: {}", e),
            }
        });
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API server shutting down...");
        Ok(())
    }
}
