//! Agent driver seam between the engine and the in-sandbox agent process.
//!
//! The engine owns the run lifecycle; the driver owns the conversation with
//! one sandbox. Every tool call the agent surfaces is adjudicated through
//! the permission gate before the sandbox may proceed with it.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use tracing::debug;
use uuid::Uuid;

use crate::core::gate::{PermissionGate, ToolDecision};

#[derive(Debug, Clone)]
pub struct AgentTask {
    pub run_id: Uuid,
    pub session_id: Uuid,
    pub prompt: String,
    pub config: Value,
    pub resume_token: Option<String>,
    /// Host-reachable endpoint of the session's sandbox.
    pub endpoint: String,
}

#[derive(Debug, Clone)]
pub enum AgentEvent {
    Message(Value),
    Todos { completed: usize, total: usize },
    StatePatch(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DriverVerdict {
    Completed,
    /// The gate issued an interrupting denial; the run stops here.
    Interrupted(String),
}

#[async_trait]
pub trait AgentDriver: Send + Sync {
    async fn run(
        &self,
        task: AgentTask,
        gate: Arc<PermissionGate>,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<DriverVerdict>;
}

// --- Sandbox wire protocol ---

#[derive(serde::Serialize)]
struct ExecutePayload<'a> {
    session_id: Uuid,
    run_id: Uuid,
    prompt: &'a str,
    config: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    resume_token: Option<&'a str>,
}

#[derive(serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum AgentAction {
    ToolRequest {
        id: String,
        tool_name: String,
        tool_input: Value,
    },
    Message {
        content: Value,
    },
    Todos {
        completed: usize,
        total: usize,
    },
    StatePatch {
        patch: Value,
    },
    Finished {
        error: Option<String>,
    },
    Idle,
}

#[derive(serde::Serialize)]
struct ToolVerdict<'a> {
    id: &'a str,
    allow: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    updated_input: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

/// Production driver: posts the task into the sandbox executor and relays
/// its action stream, gating each tool request.
pub struct SandboxDriver {
    client: reqwest::Client,
    idle_poll: Duration,
}

impl SandboxDriver {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            idle_poll: Duration::from_millis(500),
        }
    }
}

impl Default for SandboxDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentDriver for SandboxDriver {
    async fn run(
        &self,
        task: AgentTask,
        gate: Arc<PermissionGate>,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<DriverVerdict> {
        let execute_url = format!("{}/v1/tasks/execute", task.endpoint);
        let accepted: Value = self
            .client
            .post(&execute_url)
            .json(&ExecutePayload {
                session_id: task.session_id,
                run_id: task.run_id,
                prompt: &task.prompt,
                config: &task.config,
                resume_token: task.resume_token.as_deref(),
            })
            .send()
            .await
            .context("sandbox executor unreachable")?
            .error_for_status()
            .context("sandbox executor rejected the task")?
            .json()
            .await
            .context("malformed sandbox acceptance")?;
        if accepted.get("status").and_then(|s| s.as_str()) != Some("accepted") {
            bail!("sandbox executor did not accept the task");
        }

        let next_url = format!("{}/v1/tasks/{}/next", task.endpoint, task.run_id);
        let decision_url = format!("{}/v1/tasks/{}/decision", task.endpoint, task.run_id);

        loop {
            let action: AgentAction = self
                .client
                .get(&next_url)
                .send()
                .await
                .context("lost connection to sandbox")?
                .error_for_status()
                .context("sandbox action poll failed")?
                .json()
                .await
                .context("malformed sandbox action")?;

            match action {
                AgentAction::ToolRequest {
                    id,
                    tool_name,
                    tool_input,
                } => {
                    debug!("Adjudicating tool '{}' for run {}", tool_name, task.run_id);
                    let decision = gate.adjudicate(&tool_name, &tool_input).await;
                    let (verdict, interrupt_reason) = match &decision {
                        ToolDecision::Allow { updated_input } => (
                            ToolVerdict {
                                id: &id,
                                allow: true,
                                updated_input: Some(updated_input),
                                message: None,
                            },
                            None,
                        ),
                        ToolDecision::Deny { message, interrupt } => (
                            ToolVerdict {
                                id: &id,
                                allow: false,
                                updated_input: None,
                                message: Some(message.as_str()),
                            },
                            interrupt.then(|| message.clone()),
                        ),
                    };
                    self.client
                        .post(&decision_url)
                        .json(&verdict)
                        .send()
                        .await
                        .context("failed to deliver tool verdict")?
                        .error_for_status()
                        .context("sandbox refused tool verdict")?;

                    if let Some(reason) = interrupt_reason {
                        return Ok(DriverVerdict::Interrupted(reason));
                    }
                }
                AgentAction::Message { content } => {
                    let _ = events.send(AgentEvent::Message(content)).await;
                }
                AgentAction::Todos { completed, total } => {
                    let _ = events.send(AgentEvent::Todos { completed, total }).await;
                }
                AgentAction::StatePatch { patch } => {
                    let _ = events.send(AgentEvent::StatePatch(patch)).await;
                }
                AgentAction::Finished { error } => {
                    return match error {
                        None => Ok(DriverVerdict::Completed),
                        Some(message) => bail!("agent reported failure: {message}"),
                    };
                }
                AgentAction::Idle => sleep(self.idle_poll).await,
            }
        }
    }
}
