use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::core::gate::PermissionMode;
use crate::core::run::{
    NewRun, ReportDisposition, RunLifecycle, RunReport, RunState, truncate_error,
};
use crate::core::sandbox::SandboxMode;
use crate::core::store::StateStore;
use crate::core::store::types::{ScheduleMode, SessionKind};

async fn test_lifecycle() -> (RunLifecycle, Arc<StateStore>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = Arc::new(StateStore::open(dir.path()).await.expect("store"));
    (RunLifecycle::new(store.clone()), store, dir)
}

async fn queued_run(lifecycle: &RunLifecycle, store: &StateStore) -> (Uuid, Uuid) {
    let session = store
        .create_session("local", SessionKind::Scheduled, json!({}), SandboxMode::Ephemeral)
        .await
        .expect("session");
    let run = lifecycle
        .create_run(NewRun {
            session_id: session.id,
            schedule_mode: ScheduleMode::Scheduled,
            scheduled_at: Some(Utc::now()),
            permission_mode: PermissionMode::Default,
            config_snapshot: None,
            user_message_id: None,
            scheduled_task_id: None,
        })
        .await
        .expect("run");
    (run.id, session.id)
}

#[tokio::test]
async fn terminal_report_is_applied_once() {
    let (lifecycle, store, _dir) = test_lifecycle().await;
    let (run_id, session_id) = queued_run(&lifecycle, &store).await;

    lifecycle.claim(run_id).await.expect("claim");
    lifecycle.mark_running(run_id).await.expect("running");

    let first = lifecycle
        .report_outcome(run_id, RunReport::terminal(RunState::Completed, None))
        .await
        .expect("first report");
    assert_eq!(first, ReportDisposition::Applied);

    // A late duplicate with a different terminal status must not rewrite the row.
    let second = lifecycle
        .report_outcome(
            run_id,
            RunReport::terminal(RunState::Failed, Some("late failure".into())),
        )
        .await
        .expect("second report");
    assert_eq!(second, ReportDisposition::AlreadyTerminal);

    let run = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunState::Completed);
    assert_eq!(run.progress, 100);
    assert!(run.error.is_none());

    let session = store.get_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.status, "completed");
}

#[tokio::test]
async fn session_mirrors_run_status_and_state_patch() {
    let (lifecycle, store, _dir) = test_lifecycle().await;
    let (run_id, session_id) = queued_run(&lifecycle, &store).await;

    lifecycle.claim(run_id).await.expect("claim");
    lifecycle.mark_running(run_id).await.expect("running");

    let mut report = RunReport::running();
    report.progress = Some(40);
    report.state_patch = Some(json!({"todos": [{"title": "step one", "status": "completed"}]}));
    lifecycle.report_outcome(run_id, report).await.expect("progress report");

    let session = store.get_session(session_id).await.unwrap().unwrap();
    assert_eq!(session.status, "running");
    assert_eq!(
        session.state_patch["todos"][0]["title"],
        json!("step one")
    );

    // Patches overwrite, never merge.
    let mut report = RunReport::running();
    report.state_patch = Some(json!({"browser": {"enabled": true}}));
    lifecycle.report_outcome(run_id, report).await.expect("second patch");

    let session = store.get_session(session_id).await.unwrap().unwrap();
    assert!(session.state_patch.get("todos").is_none());
    assert_eq!(session.state_patch["browser"]["enabled"], json!(true));
}

#[tokio::test]
async fn claim_races_lose_cleanly() {
    let (lifecycle, store, _dir) = test_lifecycle().await;
    let (run_id, _) = queued_run(&lifecycle, &store).await;

    lifecycle.claim(run_id).await.expect("first claim");
    assert!(lifecycle.claim(run_id).await.is_err());
}

#[tokio::test]
async fn backward_report_is_rejected() {
    let (lifecycle, store, _dir) = test_lifecycle().await;
    let (run_id, _) = queued_run(&lifecycle, &store).await;

    lifecycle.claim(run_id).await.expect("claim");
    lifecycle.mark_running(run_id).await.expect("running");

    let mut report = RunReport::default();
    report.status = Some(RunState::Queued);
    assert!(lifecycle.report_outcome(run_id, report).await.is_err());
}

#[tokio::test]
async fn stale_running_run_does_not_block_session() {
    let (lifecycle, store, _dir) = test_lifecycle().await;
    let (run_id, session_id) = queued_run(&lifecycle, &store).await;

    lifecycle.claim(run_id).await.expect("claim");
    lifecycle.mark_running(run_id).await.expect("running");

    let now = Utc::now();
    assert!(
        lifecycle
            .is_session_busy(session_id, Duration::hours(24), now)
            .await
            .unwrap()
    );

    // Viewed from 25 hours in the future the run is stale and ignored.
    let later = now + Duration::hours(25);
    assert!(
        !lifecycle
            .is_session_busy(session_id, Duration::hours(24), later)
            .await
            .unwrap()
    );
}

#[test]
fn error_summaries_are_bounded() {
    let long = "x".repeat(2000);
    let summary = truncate_error(&long);
    assert!(summary.chars().count() <= 503);
    assert!(summary.ends_with("..."));
    assert_eq!(truncate_error("short"), "short");
}
