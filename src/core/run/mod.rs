//! Run lifecycle: the forward-only status state machine and the manager that
//! mutates run rows and mirrors their status onto the owning session.
//!
//! The execution engine reports everything — progress, incremental messages,
//! state patches, terminal status — through the single idempotent
//! [`RunLifecycle::report_outcome`] call. A duplicate report against an
//! already-terminal run is a no-op, not an error.

#[cfg(test)]
mod tests;

use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::core::store::StateStore;
use crate::core::store::types::RunRecord;

pub use crate::core::store::runs::NewRun;

/// Bound on error text persisted to run/task rows and shown to callers.
/// Raw internal error chains never leave the process.
const ERROR_SUMMARY_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Claimed,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Queued => "queued",
            RunState::Claimed => "claimed",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
            RunState::Canceled => "canceled",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(RunState::Queued),
            "claimed" => Some(RunState::Claimed),
            "running" => Some(RunState::Running),
            "completed" => Some(RunState::Completed),
            "failed" => Some(RunState::Failed),
            "canceled" => Some(RunState::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Canceled
        )
    }
}

/// Forward-only transitions. Same-state is allowed so repeated `running`
/// progress reports flow through the same path as terminal ones.
pub fn can_transition(from: RunState, to: RunState) -> bool {
    if from == to {
        return true;
    }
    match from {
        RunState::Queued => matches!(
            to,
            RunState::Claimed | RunState::Failed | RunState::Canceled
        ),
        RunState::Claimed => matches!(
            to,
            RunState::Running | RunState::Failed | RunState::Canceled
        ),
        RunState::Running => matches!(
            to,
            RunState::Completed | RunState::Failed | RunState::Canceled
        ),
        RunState::Completed | RunState::Failed | RunState::Canceled => false,
    }
}

pub fn truncate_error(text: &str) -> String {
    if text.chars().count() > ERROR_SUMMARY_LIMIT {
        let cut: String = text.chars().take(ERROR_SUMMARY_LIMIT).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub status: Option<RunState>,
    pub progress: Option<i64>,
    pub message: Option<Value>,
    pub state_patch: Option<Value>,
    pub error: Option<String>,
}

impl RunReport {
    pub fn running() -> Self {
        Self {
            status: Some(RunState::Running),
            ..Default::default()
        }
    }

    pub fn terminal(status: RunState, error: Option<String>) -> Self {
        Self {
            status: Some(status),
            error,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportDisposition {
    Applied,
    AlreadyTerminal,
}

pub struct RunLifecycle {
    store: Arc<StateStore>,
}

impl RunLifecycle {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    pub async fn create_run(&self, new_run: NewRun) -> Result<RunRecord> {
        self.store.insert_run(new_run).await
    }

    /// An execution engine instance takes ownership of a queued run.
    pub async fn claim(&self, run_id: Uuid) -> Result<RunRecord> {
        let claimed = self
            .store
            .transition_run(run_id, RunState::Queued, RunState::Claimed)
            .await?;
        if !claimed {
            bail!("run {run_id} is not claimable");
        }
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| anyhow!("run not found: {run_id}"))
    }

    /// Execution has started against a sandbox.
    pub async fn mark_running(&self, run_id: Uuid) -> Result<()> {
        let moved = self
            .store
            .transition_run(run_id, RunState::Claimed, RunState::Running)
            .await?;
        if !moved {
            bail!("run {run_id} is not in claimed state");
        }
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| anyhow!("run not found: {run_id}"))?;
        self.store
            .apply_session_report(run.session_id, RunState::Running.as_str(), None)
            .await
    }

    /// The single completion/progress path. Terminal status is applied at
    /// most once; later reports for a finished run are swallowed.
    pub async fn report_outcome(
        &self,
        run_id: Uuid,
        report: RunReport,
    ) -> Result<ReportDisposition> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| anyhow!("run not found: {run_id}"))?;

        if run.status.is_terminal() {
            return Ok(ReportDisposition::AlreadyTerminal);
        }

        let status = report.status.unwrap_or(run.status);
        if !can_transition(run.status, status) {
            bail!(
                "illegal run transition {} -> {}",
                run.status.as_str(),
                status.as_str()
            );
        }

        let progress = report.progress.unwrap_or(run.progress).clamp(0, 100);
        if status.is_terminal() {
            let progress = if status == RunState::Completed {
                100
            } else {
                progress
            };
            let error = report.error.as_deref().map(truncate_error);
            self.store
                .finish_run(run_id, status, progress, error.as_deref())
                .await?;
        } else {
            self.store.update_run_progress(run_id, progress).await?;
        }

        if let Some(message) = report.message {
            let preview = message_preview(&message);
            self.store
                .create_message(run.session_id, "assistant", message, &preview)
                .await?;
        }

        self.store
            .apply_session_report(run.session_id, status.as_str(), report.state_patch.as_ref())
            .await?;

        Ok(ReportDisposition::Applied)
    }

    /// Whether a non-terminal run should block a new dispatch against the
    /// session. Runs stuck in `running` past the staleness cutoff no longer
    /// count as busy; their rows are not rewritten.
    pub async fn is_session_busy(
        &self,
        session_id: Uuid,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let runs = self.store.active_runs(session_id).await?;
        let stale_floor = now - stale_after;
        Ok(runs.iter().any(|run| {
            if run.status == RunState::Running {
                match run.started_at {
                    Some(started) => started > stale_floor,
                    None => true,
                }
            } else {
                true
            }
        }))
    }
}

fn message_preview(content: &Value) -> String {
    let text = content
        .get("content")
        .and_then(|blocks| blocks.as_array())
        .and_then(|blocks| {
            blocks
                .iter()
                .find_map(|block| block.get("text").and_then(|t| t.as_str()))
        })
        .or_else(|| content.as_str());
    match text {
        Some(t) => t.chars().take(500).collect(),
        None => String::new(),
    }
}
