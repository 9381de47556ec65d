use crate::core::run::{RunState, can_transition};

#[test]
fn happy_path_transitions_are_allowed() {
    let path = [
        (RunState::Queued, RunState::Claimed),
        (RunState::Claimed, RunState::Running),
        (RunState::Running, RunState::Completed),
    ];
    for (from, to) in path {
        assert!(
            can_transition(from, to),
            "expected transition {:?} -> {:?} to be allowed",
            from,
            to
        );
    }
}

#[test]
fn status_never_moves_backward() {
    assert!(!can_transition(RunState::Running, RunState::Claimed));
    assert!(!can_transition(RunState::Running, RunState::Queued));
    assert!(!can_transition(RunState::Claimed, RunState::Queued));
}

#[test]
fn terminal_states_admit_nothing_new() {
    for terminal in [RunState::Completed, RunState::Failed, RunState::Canceled] {
        for to in [
            RunState::Queued,
            RunState::Claimed,
            RunState::Running,
            RunState::Completed,
            RunState::Failed,
            RunState::Canceled,
        ] {
            if to == terminal {
                continue;
            }
            assert!(
                !can_transition(terminal, to),
                "expected {:?} -> {:?} to be rejected",
                terminal,
                to
            );
        }
    }
}

#[test]
fn cancel_is_allowed_from_active_states() {
    for from in [RunState::Queued, RunState::Claimed, RunState::Running] {
        assert!(
            can_transition(from, RunState::Canceled),
            "expected cancel from {:?}",
            from
        );
    }
}

#[test]
fn failure_is_reachable_before_execution_starts() {
    // Provisioning can fail while the run is still claimed.
    assert!(can_transition(RunState::Queued, RunState::Failed));
    assert!(can_transition(RunState::Claimed, RunState::Failed));
}
