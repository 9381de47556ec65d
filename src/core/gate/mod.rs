//! Tool permission gate: the per-run state machine consulted synchronously
//! before every tool invocation.
//!
//! A run started in plan mode opens in the `Planning` phase, where only the
//! inspection allow-list and the two human-interaction tools may execute.
//! Both human-interaction tools share one primitive: write a permission
//! request visible to an external reviewer, then block on a bounded wait for
//! an answer. The wait polls the shared store rather than an in-memory
//! condition — the answer may be written by a different process entirely.

#[cfg(test)]
mod tests;

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, sleep};
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::store::StateStore;
use crate::core::store::types::RequestStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    Plan,
    BypassPermissions,
}

impl PermissionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::Plan => "plan",
            PermissionMode::BypassPermissions => "bypassPermissions",
        }
    }

    /// Unknown modes normalize to `default` rather than erroring.
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "acceptEdits" => PermissionMode::AcceptEdits,
            "plan" => PermissionMode::Plan,
            "bypassPermissions" => PermissionMode::BypassPermissions,
            _ => PermissionMode::Default,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePhase {
    Normal,
    Planning,
}

/// Closed tool identity: the gate switches on this variant rather than on
/// string membership scattered across call sites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolIdentity {
    /// Read-only/inspection tools allowed in every phase.
    Inspect,
    AskUser,
    ExitPlanMode,
    Other(String),
}

impl ToolIdentity {
    pub fn classify(name: &str) -> Self {
        match name {
            "Read" | "Grep" | "Glob" | "TodoWrite" | "Task" | "Skill" => ToolIdentity::Inspect,
            "AskUserQuestion" => ToolIdentity::AskUser,
            "ExitPlanMode" => ToolIdentity::ExitPlanMode,
            other => ToolIdentity::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolDecision {
    Allow {
        updated_input: Value,
    },
    Deny {
        message: String,
        /// Interrupting denials stop the run instead of skipping the call.
        interrupt: bool,
    },
}

impl ToolDecision {
    fn allow(input: Value) -> Self {
        ToolDecision::Allow {
            updated_input: input,
        }
    }

    fn deny(message: impl Into<String>) -> Self {
        ToolDecision::Deny {
            message: message.into(),
            interrupt: false,
        }
    }

    fn interrupt(message: impl Into<String>) -> Self {
        ToolDecision::Deny {
            message: message.into(),
            interrupt: true,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub question_timeout_secs: u64,
    pub plan_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            question_timeout_secs: 60,
            plan_timeout_secs: 600,
            poll_interval_ms: 250,
        }
    }
}

pub struct PermissionGate {
    store: Arc<StateStore>,
    session_id: Uuid,
    run_id: Uuid,
    phase: Mutex<GatePhase>,
    config: GateConfig,
}

impl PermissionGate {
    pub fn new(
        store: Arc<StateStore>,
        session_id: Uuid,
        run_id: Uuid,
        mode: PermissionMode,
        config: GateConfig,
    ) -> Self {
        let phase = if mode == PermissionMode::Plan {
            GatePhase::Planning
        } else {
            GatePhase::Normal
        };
        Self {
            store,
            session_id,
            run_id,
            phase: Mutex::new(phase),
            config,
        }
    }

    pub async fn phase(&self) -> GatePhase {
        *self.phase.lock().await
    }

    #[cfg(test)]
    pub(crate) fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Adjudicate one tool call. Exactly one call is adjudicated at a time
    /// per run; the agent loop blocks on the returned decision.
    pub async fn adjudicate(&self, tool_name: &str, input: &Value) -> ToolDecision {
        let identity = ToolIdentity::classify(tool_name);

        if *self.phase.lock().await == GatePhase::Planning {
            if let ToolIdentity::Other(name) = &identity {
                return ToolDecision::deny(format!(
                    "Tool '{name}' is not allowed before the plan is approved"
                ));
            }
        }

        match identity {
            ToolIdentity::AskUser => self.ask_user(input).await,
            ToolIdentity::ExitPlanMode => self.plan_approval(input).await,
            ToolIdentity::Inspect | ToolIdentity::Other(_) => {
                ToolDecision::allow(input.clone())
            }
        }
    }

    /// Suspend on a reviewer answer; on timeout the question is simply
    /// denied and the agent may carry on without it.
    async fn ask_user(&self, input: &Value) -> ToolDecision {
        let timeout = Duration::from_secs(self.config.question_timeout_secs);
        let expires_at = Utc::now() + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());

        let request = match self
            .store
            .create_permission_request(
                self.session_id,
                self.run_id,
                "AskUserQuestion",
                input,
                expires_at,
            )
            .await
        {
            Ok(request) => request,
            Err(e) => {
                warn!("Failed to create user input request: {}", e);
                return ToolDecision::deny("User input handling failed");
            }
        };

        match self.wait_for_answer(request.id, timeout).await {
            Some(answers) => ToolDecision::allow(json!({
                "questions": input.get("questions").cloned().unwrap_or_else(|| json!([])),
                "answers": answers,
            })),
            None => ToolDecision::deny("User input timeout"),
        }
    }

    /// Plan approval is stricter than a question: an unanswered or rejected
    /// plan interrupts the run — an uninspected plan must not silently let
    /// the agent proceed.
    async fn plan_approval(&self, input: &Value) -> ToolDecision {
        let timeout = Duration::from_secs(self.config.plan_timeout_secs);
        let expires_at = Utc::now() + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());

        let request = match self
            .store
            .create_permission_request(
                self.session_id,
                self.run_id,
                "ExitPlanMode",
                input,
                expires_at,
            )
            .await
        {
            Ok(request) => request,
            Err(e) => {
                warn!("Failed to create plan approval request: {}", e);
                return ToolDecision::interrupt("Plan approval handling failed");
            }
        };

        let answers = match self.wait_for_answer(request.id, timeout).await {
            Some(answers) => answers,
            None => return ToolDecision::interrupt("Plan approval timeout"),
        };

        // Strict protocol: only the literal "true" (case-insensitive,
        // trimmed, string-typed) counts as approval.
        let approved = answers
            .get("approved")
            .and_then(|v| v.as_str())
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if !approved {
            return ToolDecision::interrupt("Plan not approved");
        }

        *self.phase.lock().await = GatePhase::Normal;
        info!("Plan approved for run {}; leaving planning phase", self.run_id);
        ToolDecision::allow(input.clone())
    }

    async fn wait_for_answer(&self, request_id: Uuid, timeout: Duration) -> Option<Value> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.store.get_permission_request(request_id).await {
                Ok(Some(request)) => match request.status {
                    RequestStatus::Answered => return request.answers,
                    RequestStatus::Expired => return None,
                    RequestStatus::Pending => {}
                },
                Ok(None) => return None,
                Err(e) => {
                    warn!("Failed to poll permission request {}: {}", request_id, e);
                }
            }

            if Instant::now() >= deadline {
                if let Err(e) = self.store.expire_permission_request(request_id).await {
                    warn!("Failed to expire permission request {}: {}", request_id, e);
                }
                return None;
            }
            sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
        }
    }
}
