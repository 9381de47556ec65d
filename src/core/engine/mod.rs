//! Execution engine: accepts a run, provisions its sandbox, drives the agent
//! through the permission gate, and reports everything back through the run
//! lifecycle's idempotent outcome call.
//!
//! `submit` is fire-and-forget: the acknowledgment returns immediately and
//! the work continues as an independent background task. Completion is
//! communicated exclusively through `report_outcome` — never through shared
//! state read by the original caller.

mod driver;
#[cfg(test)]
mod tests;

use std::sync::Arc;

use anyhow::{Result, anyhow, ensure};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::gate::{GateConfig, PermissionGate, PermissionMode};
use crate::core::run::{RunLifecycle, RunReport, RunState};
use crate::core::sandbox::{SandboxMode, SandboxPool};
use crate::core::store::StateStore;
use crate::core::store::types::SessionRecord;

pub use driver::{AgentDriver, AgentEvent, AgentTask, DriverVerdict, SandboxDriver};

#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub run_id: Uuid,
    pub session_id: Uuid,
    pub prompt: String,
    pub config: Value,
    pub permission_mode: PermissionMode,
    pub resume_token: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Ack {
    pub run_id: Uuid,
    pub session_id: Uuid,
}

pub struct ExecutionEngine {
    store: Arc<StateStore>,
    lifecycle: Arc<RunLifecycle>,
    pool: Arc<SandboxPool>,
    driver: Arc<dyn AgentDriver>,
    gate_config: GateConfig,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<StateStore>,
        lifecycle: Arc<RunLifecycle>,
        pool: Arc<SandboxPool>,
        driver: Arc<dyn AgentDriver>,
        gate_config: GateConfig,
    ) -> Self {
        Self {
            store,
            lifecycle,
            pool,
            driver,
            gate_config,
        }
    }

    /// Load a queued run and launch it in the background.
    pub async fn submit_run(self: Arc<Self>, run_id: Uuid) -> Result<Ack> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| anyhow!("run not found: {run_id}"))?;
        let session = self
            .store
            .get_session(run.session_id)
            .await?
            .ok_or_else(|| anyhow!("session not found: {}", run.session_id))?;

        let prompt = match run.user_message_id {
            Some(message_id) => self
                .store
                .get_message(message_id)
                .await?
                .and_then(|message| prompt_text(&message.content))
                .unwrap_or_default(),
            None => String::new(),
        };
        ensure!(!prompt.trim().is_empty(), "run {run_id} has no prompt");

        let request = ExecuteRequest {
            run_id,
            session_id: session.id,
            prompt,
            config: run
                .config_snapshot
                .unwrap_or_else(|| Value::Object(Default::default())),
            permission_mode: run.permission_mode,
            resume_token: None,
        };
        Ok(self.submit(request, &session))
    }

    /// Accept the work and return immediately; execution continues on a
    /// spawned task.
    pub fn submit(self: Arc<Self>, request: ExecuteRequest, session: &SessionRecord) -> Ack {
        let ack = Ack {
            run_id: request.run_id,
            session_id: session.id,
        };
        let session = session.clone();
        tokio::spawn(async move {
            self.execute(request, session).await;
        });
        ack
    }

    async fn execute(self: Arc<Self>, request: ExecuteRequest, session: SessionRecord) {
        let run_id = request.run_id;

        if let Err(e) = self.lifecycle.claim(run_id).await {
            warn!("Run {} could not be claimed: {}", run_id, e);
            return;
        }

        info!(
            "Run {} started for session {} (mode: {})",
            run_id,
            session.id,
            request.permission_mode.as_str()
        );

        let existing_container = if session.container_mode == SandboxMode::Persistent {
            session.container_id.as_deref()
        } else {
            None
        };
        let allocation = match self
            .pool
            .acquire(
                session.id,
                &session.owner_id,
                session.container_mode,
                existing_container,
            )
            .await
        {
            Ok(allocation) => allocation,
            Err(e) => {
                warn!("Sandbox provisioning failed for run {}: {}", run_id, e);
                self.finish(
                    run_id,
                    RunReport::terminal(
                        RunState::Failed,
                        Some(format!("sandbox provisioning failed: {e}")),
                    ),
                )
                .await;
                return;
            }
        };

        if session.container_mode == SandboxMode::Persistent {
            if let Err(e) = self
                .store
                .set_session_container(session.id, Some(&allocation.container_id))
                .await
            {
                warn!("Failed to record container for session {}: {}", session.id, e);
            }
        }

        if let Err(e) = self.lifecycle.mark_running(run_id).await {
            warn!("Run {} could not enter running state: {}", run_id, e);
            self.pool.release(session.id).await;
            return;
        }

        let gate = Arc::new(PermissionGate::new(
            self.store.clone(),
            session.id,
            run_id,
            request.permission_mode,
            self.gate_config.clone(),
        ));
        let task = AgentTask {
            run_id,
            session_id: session.id,
            prompt: request.prompt,
            config: request.config,
            resume_token: request.resume_token,
            endpoint: allocation.endpoint,
        };

        let (events_tx, mut events_rx) = mpsc::channel(32);
        let driver = self.driver.clone();
        let driving = tokio::spawn(async move { driver.run(task, gate, events_tx).await });

        while let Some(event) = events_rx.recv().await {
            let report = match event {
                AgentEvent::Message(content) => RunReport {
                    status: Some(RunState::Running),
                    message: Some(content),
                    ..Default::default()
                },
                AgentEvent::Todos { completed, total } => RunReport {
                    status: Some(RunState::Running),
                    progress: Some(todo_progress(completed, total)),
                    ..Default::default()
                },
                AgentEvent::StatePatch(patch) => RunReport {
                    status: Some(RunState::Running),
                    state_patch: Some(patch),
                    ..Default::default()
                },
            };
            if let Err(e) = self.lifecycle.report_outcome(run_id, report).await {
                warn!("Progress report for run {} failed: {}", run_id, e);
            }
        }

        let report = match driving.await {
            Ok(Ok(DriverVerdict::Completed)) => RunReport::terminal(RunState::Completed, None),
            Ok(Ok(DriverVerdict::Interrupted(reason))) => {
                RunReport::terminal(RunState::Failed, Some(reason))
            }
            Ok(Err(e)) => RunReport::terminal(RunState::Failed, Some(e.to_string())),
            Err(e) => RunReport::terminal(RunState::Failed, Some(format!("driver task failed: {e}"))),
        };

        info!(
            "Run {} finished with status {}",
            run_id,
            report.status.map(RunState::as_str).unwrap_or("unknown")
        );
        self.finish(run_id, report).await;
        self.pool.release(session.id).await;
    }

    async fn finish(&self, run_id: Uuid, report: RunReport) {
        if let Err(e) = self.lifecycle.report_outcome(run_id, report).await {
            warn!("Terminal report for run {} failed: {}", run_id, e);
        }
    }

    /// Hard stop: tear the sandbox down regardless of reference counts, then
    /// record the run canceled. In-flight tool calls surface this as an
    /// abrupt failure, which the terminal-once rule swallows.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<()> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| anyhow!("run not found: {run_id}"))?;

        self.pool.cancel(run.session_id).await;
        self.lifecycle
            .report_outcome(run_id, RunReport::terminal(RunState::Canceled, None))
            .await?;
        Ok(())
    }
}

fn todo_progress(completed: usize, total: usize) -> i64 {
    if total == 0 {
        0
    } else {
        ((completed * 100) / total) as i64
    }
}

/// Extract the prompt text from a stored user message body.
fn prompt_text(content: &Value) -> Option<String> {
    content
        .get("content")
        .and_then(|blocks| blocks.as_array())
        .and_then(|blocks| {
            blocks
                .iter()
                .find_map(|block| block.get("text").and_then(|t| t.as_str()))
        })
        .map(str::to_string)
}
