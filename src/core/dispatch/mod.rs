//! Scheduled-task definitions and the cron-driven dispatcher that turns them
//! into concrete runs.
//!
//! Each tick claims up to a batch of due definitions (claim marker written in
//! the selecting transaction, so overlapping ticks never double-fire), then
//! materializes one run per definition. A pinned session with a run still in
//! flight is skipped, but its fire time is advanced anyway — a missed firing
//! coalesces into the next occurrence instead of staying perpetually due.
//! One definition's failure never blocks the rest of the batch.

#[cfg(test)]
mod tests;

use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::gate::PermissionMode;
use crate::core::run::{NewRun, RunLifecycle, truncate_error};
use crate::core::sandbox::SandboxMode;
use crate::core::schedule;
use crate::core::store::StateStore;
use crate::core::store::tasks::NewScheduledTask;
use crate::core::store::types::{RunRecord, ScheduleMode, ScheduledTaskRecord, SessionKind};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Cadence of the dispatcher tick on the daemon scheduler.
    pub tick_cron: String,
    /// Maximum definitions claimed per tick.
    pub batch_limit: usize,
    /// Rows claimed more recently than this are invisible to other ticks.
    pub claim_ttl_secs: i64,
    /// A `running` run older than this no longer blocks its session.
    pub stale_running_hours: i64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick_cron: "0 * * * * *".to_string(),
            batch_limit: 50,
            claim_ttl_secs: 55,
            stale_running_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DispatchSummary {
    pub dispatched: usize,
    pub run_ids: Vec<Uuid>,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CreateTaskRequest {
    pub name: String,
    pub cron: String,
    #[serde(default)]
    pub timezone: Option<String>,
    pub prompt: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub reuse_session: bool,
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default)]
    pub input_files: Option<Value>,
    /// Sandbox mode for the pinned session when `reuse_session` is set.
    #[serde(default)]
    pub container_mode: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct UpdateTaskRequest {
    pub name: Option<String>,
    pub cron: Option<String>,
    pub timezone: Option<String>,
    pub prompt: Option<String>,
    pub enabled: Option<bool>,
}

pub struct TaskDispatcher {
    store: Arc<StateStore>,
    lifecycle: Arc<RunLifecycle>,
    config: DispatchConfig,
}

impl TaskDispatcher {
    pub fn new(store: Arc<StateStore>, lifecycle: Arc<RunLifecycle>, config: DispatchConfig) -> Self {
        Self {
            store,
            lifecycle,
            config,
        }
    }

    // --- Definition CRUD ---

    /// Cron, timezone, name, and prompt are validated here, synchronously —
    /// a definition that reaches the table is always dispatchable.
    pub async fn create_task(
        &self,
        owner_id: &str,
        request: CreateTaskRequest,
    ) -> Result<ScheduledTaskRecord> {
        let name = schedule::normalize_name(&request.name)?;
        let prompt = schedule::normalize_prompt(&request.prompt)?;
        let cron = schedule::validate_cron(&request.cron)?;
        let timezone = schedule::validate_timezone(request.timezone.as_deref())?;

        let config_snapshot = request
            .config
            .unwrap_or_else(|| Value::Object(Default::default()));
        let container_mode = request
            .container_mode
            .as_deref()
            .and_then(SandboxMode::parse)
            .unwrap_or(SandboxMode::Ephemeral);

        // A session-reusing task owns its pinned session from day one.
        let session_id = if request.reuse_session {
            let session = self
                .store
                .create_session(
                    owner_id,
                    SessionKind::Scheduled,
                    config_snapshot.clone(),
                    container_mode,
                )
                .await?;
            Some(session.id)
        } else {
            None
        };

        let next_fire_at = schedule::next_fire_at(&cron, &timezone, Utc::now())?;
        let task = self
            .store
            .insert_scheduled_task(NewScheduledTask {
                owner_id: owner_id.to_string(),
                name,
                cron,
                timezone,
                prompt,
                enabled: request.enabled,
                reuse_session: request.reuse_session,
                session_id,
                config_snapshot,
                input_files: request.input_files,
                next_fire_at,
            })
            .await?;

        info!(
            "Scheduled task {} created (reuse_session: {}, next fire: {})",
            task.id, task.reuse_session, task.next_fire_at
        );
        Ok(task)
    }

    pub async fn get_task(&self, owner_id: &str, task_id: Uuid) -> Result<ScheduledTaskRecord> {
        let task = self
            .store
            .get_scheduled_task(task_id)
            .await?
            .ok_or_else(|| anyhow!("scheduled task not found: {task_id}"))?;
        if task.owner_id != owner_id {
            return Err(anyhow!("scheduled task not found: {task_id}"));
        }
        Ok(task)
    }

    pub async fn list_tasks(&self, owner_id: &str) -> Result<Vec<ScheduledTaskRecord>> {
        self.store.list_scheduled_tasks(owner_id).await
    }

    pub async fn update_task(
        &self,
        owner_id: &str,
        task_id: Uuid,
        request: UpdateTaskRequest,
    ) -> Result<ScheduledTaskRecord> {
        let mut task = self.get_task(owner_id, task_id).await?;

        let mut recompute = false;
        if let Some(name) = request.name {
            task.name = schedule::normalize_name(&name)?;
        }
        if let Some(prompt) = request.prompt {
            task.prompt = schedule::normalize_prompt(&prompt)?;
        }
        if let Some(enabled) = request.enabled {
            task.enabled = enabled;
        }
        if let Some(cron) = request.cron {
            task.cron = schedule::validate_cron(&cron)?;
            recompute = true;
        }
        if let Some(timezone) = request.timezone {
            task.timezone = schedule::validate_timezone(Some(&timezone))?;
            recompute = true;
        }

        if recompute {
            task.next_fire_at = schedule::next_fire_at(&task.cron, &task.timezone, Utc::now())?;
        }

        self.store.update_scheduled_task_fields(&task).await?;
        self.get_task(owner_id, task_id).await
    }

    /// Soft delete: excluded from future dispatch, retained for audit.
    pub async fn delete_task(&self, owner_id: &str, task_id: Uuid) -> Result<()> {
        let task = self.get_task(owner_id, task_id).await?;
        self.store.soft_delete_scheduled_task(task.id).await?;
        Ok(())
    }

    /// Manual "run it now": bypasses the skip-if-active rule but shares the
    /// materialization path with the tick.
    pub async fn trigger_now(&self, owner_id: &str, task_id: Uuid) -> Result<RunRecord> {
        let task = self.get_task(owner_id, task_id).await?;
        let now = Utc::now();
        let run = self
            .materialize_run(&task, now, true, now)
            .await?
            .ok_or_else(|| anyhow!("failed to enqueue run for task {task_id}"))?;
        self.store
            .record_task_triggered(task.id, run.id, run.status.as_str())
            .await?;
        Ok(run)
    }

    // --- Dispatch ---

    pub async fn tick(&self) -> DispatchSummary {
        self.tick_at(Utc::now()).await
    }

    pub async fn tick_at(&self, now: DateTime<Utc>) -> DispatchSummary {
        let claim_ttl = Duration::seconds(self.config.claim_ttl_secs);
        let tasks = match self
            .store
            .claim_due_tasks(now, self.config.batch_limit, claim_ttl)
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                error!("Failed to claim due tasks: {}", e);
                return DispatchSummary::default();
            }
        };

        let mut summary = DispatchSummary::default();
        for task in tasks {
            let outcome: Result<Option<RunRecord>> = async {
                match self
                    .materialize_run(&task, task.next_fire_at, false, now)
                    .await?
                {
                    None => {
                        // Coalesce the missed firing into the next occurrence;
                        // otherwise the task stays due and is re-claimed every
                        // cycle while its run is in flight.
                        let next = schedule::next_fire_at(&task.cron, &task.timezone, now)?;
                        self.store.advance_task_schedule(task.id, next).await?;
                        Ok(None)
                    }
                    Some(run) => {
                        let next = schedule::next_fire_at(&task.cron, &task.timezone, now)?;
                        self.store
                            .record_task_dispatched(task.id, run.id, run.status.as_str(), next)
                            .await?;
                        Ok(Some(run))
                    }
                }
            }
            .await;

            match outcome {
                Ok(Some(run)) => {
                    summary.dispatched += 1;
                    summary.run_ids.push(run.id);
                }
                Ok(None) => summary.skipped += 1,
                Err(e) => {
                    summary.errors += 1;
                    warn!("Dispatch failed for scheduled task {}: {}", task.id, e);

                    // A pinned session that no longer exists would fail every
                    // tick forever; disable the definition instead.
                    let mut disable = false;
                    if task.reuse_session {
                        if let Some(session_id) = task.session_id {
                            let session = self.store.get_session(session_id).await.ok().flatten();
                            disable = session.is_none();
                        }
                    }
                    if let Err(record_err) = self
                        .store
                        .record_task_error(task.id, &truncate_error(&e.to_string()), disable)
                        .await
                    {
                        error!(
                            "Failed to record dispatch error for task {}: {}",
                            task.id, record_err
                        );
                    }
                }
            }
        }

        if summary.dispatched + summary.skipped + summary.errors > 0 {
            info!(
                "Dispatch tick: {} dispatched, {} skipped, {} errors",
                summary.dispatched, summary.skipped, summary.errors
            );
        }
        summary
    }

    /// Create (message, run) for one firing. Returns None when skipped
    /// because the target session is busy.
    async fn materialize_run(
        &self,
        task: &ScheduledTaskRecord,
        scheduled_at: DateTime<Utc>,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<RunRecord>> {
        let prompt = schedule::normalize_prompt(&task.prompt)?;

        let session = if task.reuse_session {
            let session_id = task
                .session_id
                .ok_or_else(|| anyhow!("reuse_session is set but the task has no pinned session"))?;
            self.store
                .get_session(session_id)
                .await?
                .ok_or_else(|| anyhow!("session not found: {session_id}"))?
        } else {
            // A fresh session/workspace for every firing.
            self.store
                .create_session(
                    &task.owner_id,
                    SessionKind::Scheduled,
                    task.config_snapshot.clone(),
                    SandboxMode::Ephemeral,
                )
                .await?
        };

        // At most one unfinished run per reuse target.
        if !force {
            let stale_after = Duration::hours(self.config.stale_running_hours);
            if self
                .lifecycle
                .is_session_busy(session.id, stale_after, now)
                .await?
            {
                return Ok(None);
            }
        }

        self.store.reset_session_for_run(session.id).await?;

        let content = json!({
            "role": "user",
            "content": [{"type": "text", "text": prompt}],
        });
        let message = self
            .store
            .create_message(session.id, "user", content, &prompt)
            .await?;

        let mut snapshot = task.config_snapshot.clone();
        if let Some(files) = &task.input_files {
            if let Some(map) = snapshot.as_object_mut() {
                map.insert("input_files".to_string(), files.clone());
            }
        }

        let run = self
            .lifecycle
            .create_run(NewRun {
                session_id: session.id,
                schedule_mode: ScheduleMode::Scheduled,
                scheduled_at: Some(scheduled_at),
                permission_mode: PermissionMode::Default,
                config_snapshot: Some(snapshot),
                user_message_id: Some(message.id),
                scheduled_task_id: Some(task.id),
            })
            .await?;
        Ok(Some(run))
    }
}
