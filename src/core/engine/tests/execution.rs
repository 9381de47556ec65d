use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use uuid::Uuid;

use crate::core::engine::{
    AgentDriver, AgentEvent, AgentTask, DriverVerdict, ExecutionEngine,
};
use crate::core::gate::{GateConfig, PermissionGate, PermissionMode, ToolDecision};
use crate::core::run::{NewRun, RunLifecycle, RunState};
use crate::core::sandbox::runtime::{
    ContainerRuntime, ContainerSpec, ContainerState, ProvisionError,
};
use crate::core::sandbox::{SandboxConfig, SandboxMode, SandboxPool};
use crate::core::store::StateStore;
use crate::core::store::types::{RunRecord, ScheduleMode, SessionKind};

// --- Fakes ---

#[derive(Default)]
struct FakeRuntime {
    fail_provisioning: bool,
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ensure_volume(&self, _name: &str) -> Result<(), ProvisionError> {
        Ok(())
    }

    async fn run(&self, _spec: &ContainerSpec) -> Result<(), ProvisionError> {
        if self.fail_provisioning {
            return Err(ProvisionError::Runtime("image missing".to_string()));
        }
        Ok(())
    }

    async fn state(&self, _name: &str) -> Result<ContainerState, ProvisionError> {
        Ok(ContainerState::Running)
    }

    async fn host_port(
        &self,
        _name: &str,
        _container_port: u16,
    ) -> Result<Option<u16>, ProvisionError> {
        Ok(Some(49300))
    }

    async fn stop(&self, _name: &str, _grace_secs: u64) -> Result<(), ProvisionError> {
        Ok(())
    }
}

enum Script {
    Complete,
    Interrupt(String),
    Fail(String),
    Hang,
    /// Ask the gate about Bash; run the "tool" only when allowed.
    GatedBash(Arc<AtomicBool>),
}

struct ScriptedDriver {
    script: Script,
}

#[async_trait]
impl AgentDriver for ScriptedDriver {
    async fn run(
        &self,
        _task: AgentTask,
        gate: Arc<PermissionGate>,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<DriverVerdict> {
        match &self.script {
            Script::Complete => {
                let _ = events
                    .send(AgentEvent::Todos {
                        completed: 1,
                        total: 2,
                    })
                    .await;
                let _ = events
                    .send(AgentEvent::StatePatch(json!({"todos": ["done"]})))
                    .await;
                let _ = events
                    .send(AgentEvent::Message(json!({
                        "role": "assistant",
                        "content": [{"type": "text", "text": "halfway there"}],
                    })))
                    .await;
                Ok(DriverVerdict::Completed)
            }
            Script::Interrupt(reason) => Ok(DriverVerdict::Interrupted(reason.clone())),
            Script::Fail(message) => anyhow::bail!("{message}"),
            Script::Hang => {
                sleep(Duration::from_secs(60)).await;
                Ok(DriverVerdict::Completed)
            }
            Script::GatedBash(executed) => {
                let decision = gate.adjudicate("Bash", &json!({"command": "make deploy"})).await;
                if matches!(decision, ToolDecision::Allow { .. }) {
                    executed.store(true, Ordering::SeqCst);
                }
                Ok(DriverVerdict::Completed)
            }
        }
    }
}

// --- Harness ---

struct Harness {
    store: Arc<StateStore>,
    pool: Arc<SandboxPool>,
    engine: Arc<ExecutionEngine>,
    _dir: tempfile::TempDir,
}

async fn engine_with(script: Script, fail_provisioning: bool) -> Harness {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = Arc::new(StateStore::open(dir.path()).await.expect("store"));
    let lifecycle = Arc::new(RunLifecycle::new(store.clone()));
    let runtime = Arc::new(FakeRuntime { fail_provisioning });
    let pool = Arc::new(SandboxPool::new(runtime, SandboxConfig::default()));
    let engine = Arc::new(ExecutionEngine::new(
        store.clone(),
        lifecycle,
        pool.clone(),
        Arc::new(ScriptedDriver { script }),
        GateConfig::default(),
    ));
    Harness {
        store,
        pool,
        engine,
        _dir: dir,
    }
}

async fn queued_run(h: &Harness, permission_mode: PermissionMode) -> RunRecord {
    let session = h
        .store
        .create_session("local", SessionKind::Chat, json!({}), SandboxMode::Ephemeral)
        .await
        .expect("session");
    let message = h
        .store
        .create_message(
            session.id,
            "user",
            json!({"role": "user", "content": [{"type": "text", "text": "ship it"}]}),
            "ship it",
        )
        .await
        .expect("message");
    h.store
        .insert_run(NewRun {
            session_id: session.id,
            schedule_mode: ScheduleMode::Immediate,
            scheduled_at: None,
            permission_mode,
            config_snapshot: Some(json!({})),
            user_message_id: Some(message.id),
            scheduled_task_id: None,
        })
        .await
        .expect("run")
}

async fn wait_for_terminal(store: &StateStore, run_id: Uuid) -> RunRecord {
    for _ in 0..200 {
        let run = store.get_run(run_id).await.unwrap().unwrap();
        if run.status.is_terminal() {
            return run;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("run {run_id} never reached a terminal state");
}

// --- Tests ---

#[tokio::test]
async fn completed_run_reports_progress_and_releases_sandbox() {
    let h = engine_with(Script::Complete, false).await;
    let run = queued_run(&h, PermissionMode::Default).await;

    h.engine.clone().submit_run(run.id).await.expect("submit");
    let finished = wait_for_terminal(&h.store, run.id).await;

    assert_eq!(finished.status, RunState::Completed);
    assert_eq!(finished.progress, 100);
    assert!(finished.started_at.is_some());
    assert!(finished.finished_at.is_some());

    let session = h.store.get_session(run.session_id).await.unwrap().unwrap();
    assert_eq!(session.status, "completed");
    assert_eq!(session.state_patch["todos"][0], json!("done"));

    // Ephemeral sandbox reclaimed shortly after the terminal report.
    wait_for_empty_pool(&h.pool).await;
}

async fn wait_for_empty_pool(pool: &SandboxPool) {
    for _ in 0..200 {
        if pool.stats().await.total_active == 0 {
            return;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("sandbox pool never drained");
}

#[tokio::test]
async fn interrupting_denial_ends_the_run_as_failed() {
    let h = engine_with(Script::Interrupt("Plan not approved".to_string()), false).await;
    let run = queued_run(&h, PermissionMode::Plan).await;

    h.engine.clone().submit_run(run.id).await.expect("submit");
    let finished = wait_for_terminal(&h.store, run.id).await;

    assert_eq!(finished.status, RunState::Failed);
    assert!(finished.error.as_deref().unwrap().contains("Plan not approved"));
}

#[tokio::test]
async fn driver_failure_is_recorded_with_bounded_error() {
    let long_reason = "agent exploded ".repeat(100);
    let h = engine_with(Script::Fail(long_reason), false).await;
    let run = queued_run(&h, PermissionMode::Default).await;

    h.engine.clone().submit_run(run.id).await.expect("submit");
    let finished = wait_for_terminal(&h.store, run.id).await;

    assert_eq!(finished.status, RunState::Failed);
    assert!(finished.error.as_deref().unwrap().chars().count() <= 503);
}

#[tokio::test]
async fn provisioning_failure_fails_the_run_without_retry() {
    let h = engine_with(Script::Complete, true).await;
    let run = queued_run(&h, PermissionMode::Default).await;

    h.engine.clone().submit_run(run.id).await.expect("submit");
    let finished = wait_for_terminal(&h.store, run.id).await;

    assert_eq!(finished.status, RunState::Failed);
    assert!(
        finished
            .error
            .as_deref()
            .unwrap()
            .contains("sandbox provisioning failed")
    );
    assert_eq!(h.pool.stats().await.total_active, 0);
}

#[tokio::test]
async fn cancellation_is_a_hard_stop() {
    let h = engine_with(Script::Hang, false).await;
    let run = queued_run(&h, PermissionMode::Default).await;

    h.engine.clone().submit_run(run.id).await.expect("submit");

    // Wait for the run to actually start before cancelling.
    for _ in 0..200 {
        let current = h.store.get_run(run.id).await.unwrap().unwrap();
        if current.status == RunState::Running {
            break;
        }
        sleep(Duration::from_millis(25)).await;
    }

    h.engine.cancel_run(run.id).await.expect("cancel");
    let finished = wait_for_terminal(&h.store, run.id).await;
    assert_eq!(finished.status, RunState::Canceled);
    assert_eq!(h.pool.stats().await.total_active, 0);
}

#[tokio::test]
async fn plan_mode_denial_skips_the_tool_but_run_continues() {
    let executed = Arc::new(AtomicBool::new(false));
    let h = engine_with(Script::GatedBash(executed.clone()), false).await;
    let run = queued_run(&h, PermissionMode::Plan).await;

    h.engine.clone().submit_run(run.id).await.expect("submit");
    let finished = wait_for_terminal(&h.store, run.id).await;

    // The denial was non-interrupting: the run finished, and the tool's side
    // effect never happened.
    assert_eq!(finished.status, RunState::Completed);
    assert!(!executed.load(Ordering::SeqCst));
}
