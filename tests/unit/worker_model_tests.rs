//! Unit tests for the worker lifecycle model.

use engine_supervisor::models::worker::{WorkerExit, WorkerState};

#[test]
fn forward_transitions_are_allowed() {
    assert!(WorkerState::Created.can_transition_to(WorkerState::Starting));
    assert!(WorkerState::Starting.can_transition_to(WorkerState::Ready));
    assert!(WorkerState::Ready.can_transition_to(WorkerState::Exited));
}

#[test]
fn failures_and_kills_reach_exited() {
    assert!(WorkerState::Starting.can_transition_to(WorkerState::Exited));
    assert!(WorkerState::Created.can_transition_to(WorkerState::Exited));
}

#[test]
fn exited_is_terminal() {
    for next in [
        WorkerState::Created,
        WorkerState::Starting,
        WorkerState::Ready,
        WorkerState::Exited,
    ] {
        assert!(
            !WorkerState::Exited.can_transition_to(next),
            "Exited must not move to {next:?}"
        );
    }
}

#[test]
fn no_skipping_or_going_back() {
    assert!(!WorkerState::Created.can_transition_to(WorkerState::Ready));
    assert!(!WorkerState::Ready.can_transition_to(WorkerState::Starting));
    assert!(!WorkerState::Starting.can_transition_to(WorkerState::Created));
}

#[test]
fn only_exited_is_not_live() {
    assert!(WorkerState::Created.is_live());
    assert!(WorkerState::Starting.is_live());
    assert!(WorkerState::Ready.is_live());
    assert!(!WorkerState::Exited.is_live());
}

#[test]
fn state_serialises_snake_case() {
    let json = serde_json::to_string(&WorkerState::Ready).unwrap();
    assert_eq!(json, "\"ready\"");
}

#[cfg(unix)]
#[test]
fn exit_status_translation() {
    use std::os::unix::process::ExitStatusExt;

    let exited = WorkerExit::from_status(std::process::ExitStatus::from_raw(3 << 8));
    assert_eq!(exited.code, Some(3));
    assert_eq!(exited.reason, "process exited with code 3");

    let signalled = WorkerExit::from_status(std::process::ExitStatus::from_raw(9));
    assert_eq!(signalled.code, None);
    assert_eq!(signalled.reason, "process terminated by signal");
}

#[test]
fn killed_exit_has_no_code() {
    let exit = WorkerExit::killed();
    assert_eq!(exit.code, None);
    assert_eq!(exit.reason, "killed");
}
