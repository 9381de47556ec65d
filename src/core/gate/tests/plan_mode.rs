use std::sync::Arc;

use serde_json::{Value, json};
use uuid::Uuid;

use crate::core::gate::{
    GateConfig, GatePhase, PermissionGate, PermissionMode, ToolDecision, ToolIdentity,
};
use crate::core::sandbox::SandboxMode;
use crate::core::store::StateStore;
use crate::core::store::types::SessionKind;

async fn test_store() -> (Arc<StateStore>, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = Arc::new(StateStore::open(dir.path()).await.expect("store"));
    (store, dir)
}

fn fast_config() -> GateConfig {
    GateConfig {
        question_timeout_secs: 0,
        plan_timeout_secs: 0,
        poll_interval_ms: 10,
    }
}

async fn plan_gate(store: Arc<StateStore>, config: GateConfig) -> PermissionGate {
    let session = store
        .create_session("local", SessionKind::Chat, json!({}), SandboxMode::Ephemeral)
        .await
        .expect("session");
    PermissionGate::new(store, session.id, Uuid::new_v4(), PermissionMode::Plan, config)
}

/// Answer the first pending request for the gate's session from "outside".
fn answer_from_reviewer(store: Arc<StateStore>, session_id: Uuid, answers: Value) {
    tokio::spawn(async move {
        loop {
            let pending = store
                .list_pending_requests(session_id)
                .await
                .unwrap_or_default();
            if let Some(request) = pending.first() {
                store
                    .answer_permission_request(request.id, &answers)
                    .await
                    .expect("answer");
                return;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(5)).await;
        }
    });
}

#[test]
fn tool_identity_is_a_closed_classification() {
    assert_eq!(ToolIdentity::classify("Read"), ToolIdentity::Inspect);
    assert_eq!(ToolIdentity::classify("Glob"), ToolIdentity::Inspect);
    assert_eq!(ToolIdentity::classify("AskUserQuestion"), ToolIdentity::AskUser);
    assert_eq!(
        ToolIdentity::classify("ExitPlanMode"),
        ToolIdentity::ExitPlanMode
    );
    assert_eq!(
        ToolIdentity::classify("Bash"),
        ToolIdentity::Other("Bash".to_string())
    );
}

#[test]
fn unknown_permission_modes_normalize_to_default() {
    assert_eq!(PermissionMode::parse("plan"), PermissionMode::Plan);
    assert_eq!(PermissionMode::parse("acceptEdits"), PermissionMode::AcceptEdits);
    assert_eq!(PermissionMode::parse("yolo"), PermissionMode::Default);
    assert_eq!(PermissionMode::parse(""), PermissionMode::Default);
}

#[tokio::test]
async fn planning_phase_denies_side_effect_tools_without_interrupting() {
    let (store, _dir) = test_store().await;
    let gate = plan_gate(store, fast_config()).await;

    let decision = gate.adjudicate("Bash", &json!({"command": "rm -rf /"})).await;
    match decision {
        ToolDecision::Deny { message, interrupt } => {
            assert!(message.contains("Bash"));
            assert!(!interrupt);
        }
        other => panic!("expected deny, got {:?}", other),
    }
    assert_eq!(gate.phase().await, GatePhase::Planning);
}

#[tokio::test]
async fn planning_phase_allows_inspection_tools() {
    let (store, _dir) = test_store().await;
    let gate = plan_gate(store, fast_config()).await;

    let input = json!({"file_path": "/workspace/src/main.rs"});
    let decision = gate.adjudicate("Read", &input).await;
    assert_eq!(
        decision,
        ToolDecision::Allow {
            updated_input: input
        }
    );
}

#[tokio::test]
async fn question_timeout_is_a_non_interrupting_denial() {
    let (store, _dir) = test_store().await;
    let gate = plan_gate(store, fast_config()).await;

    let decision = gate
        .adjudicate("AskUserQuestion", &json!({"questions": ["deploy?"]}))
        .await;
    assert_eq!(
        decision,
        ToolDecision::Deny {
            message: "User input timeout".to_string(),
            interrupt: false
        }
    );
}

#[tokio::test]
async fn answered_question_replaces_tool_input() {
    let (store, _dir) = test_store().await;
    let gate = plan_gate(
        store.clone(),
        GateConfig {
            question_timeout_secs: 5,
            plan_timeout_secs: 5,
            poll_interval_ms: 10,
        },
    )
    .await;

    // The reviewer process writes the answer through the shared store.
    answer_from_reviewer(store.clone(), gate_session(&gate), json!({"deploy": "yes"}));

    let decision = gate
        .adjudicate("AskUserQuestion", &json!({"questions": ["deploy?"]}))
        .await;
    match decision {
        ToolDecision::Allow { updated_input } => {
            assert_eq!(updated_input["questions"], json!(["deploy?"]));
            assert_eq!(updated_input["answers"]["deploy"], json!("yes"));
        }
        other => panic!("expected allow, got {:?}", other),
    }
}

#[tokio::test]
async fn plan_approval_timeout_interrupts_the_run() {
    let (store, _dir) = test_store().await;
    let gate = plan_gate(store, fast_config()).await;

    let decision = gate.adjudicate("ExitPlanMode", &json!({"plan": "step 1"})).await;
    assert_eq!(
        decision,
        ToolDecision::Deny {
            message: "Plan approval timeout".to_string(),
            interrupt: true
        }
    );
    assert_eq!(gate.phase().await, GatePhase::Planning);
}

#[tokio::test]
async fn only_the_literal_true_approves_a_plan() {
    let (store, _dir) = test_store().await;
    let config = GateConfig {
        question_timeout_secs: 5,
        plan_timeout_secs: 5,
        poll_interval_ms: 10,
    };
    let gate = plan_gate(store.clone(), config).await;

    answer_from_reviewer(
        store.clone(),
        gate_session(&gate),
        json!({"approved": "sounds good"}),
    );

    let decision = gate.adjudicate("ExitPlanMode", &json!({"plan": "step 1"})).await;
    assert_eq!(
        decision,
        ToolDecision::Deny {
            message: "Plan not approved".to_string(),
            interrupt: true
        }
    );
}

#[tokio::test]
async fn approval_flips_the_gate_to_normal() {
    let (store, _dir) = test_store().await;
    let config = GateConfig {
        question_timeout_secs: 5,
        plan_timeout_secs: 5,
        poll_interval_ms: 10,
    };
    let gate = plan_gate(store.clone(), config).await;

    // Denied before approval.
    assert!(matches!(
        gate.adjudicate("Write", &json!({})).await,
        ToolDecision::Deny { interrupt: false, .. }
    ));

    // Whitespace and case are forgiven; the literal is not.
    answer_from_reviewer(
        store.clone(),
        gate_session(&gate),
        json!({"approved": "  TRUE  "}),
    );
    let decision = gate.adjudicate("ExitPlanMode", &json!({"plan": "step 1"})).await;
    assert!(matches!(decision, ToolDecision::Allow { .. }));
    assert_eq!(gate.phase().await, GatePhase::Normal);

    // The same tool that was denied is now allowed for the rest of the run.
    assert!(matches!(
        gate.adjudicate("Write", &json!({})).await,
        ToolDecision::Allow { .. }
    ));
}

fn gate_session(gate: &PermissionGate) -> Uuid {
    gate.session_id()
}
