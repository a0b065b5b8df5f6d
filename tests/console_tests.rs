// Console session state machine tests

mod common;

use guestdeck::console::{ConsoleGateError, ConsoleMachine};
use guestdeck::models::{ActionKind, GuestRef, GuestState, SessionConnectionState};
use guestdeck::reconcile::PendingAction;
use guestdeck::remote::TransportEvent;
use tokio::time::Instant;

fn pending(kind: ActionKind) -> PendingAction {
    PendingAction {
        kind,
        started_at: Instant::now(),
        seen_intermediate: false,
        baseline_uptime_secs: None,
    }
}

fn guest() -> GuestRef {
    GuestRef::new("h1", "web")
}

#[test]
fn connect_gate_rejects_unknown_stopped_transitional_and_pending() {
    let mut machine = ConsoleMachine::new();

    assert_eq!(
        machine.begin_connect(guest(), None, None),
        Err(ConsoleGateError::NotRunning)
    );
    assert_eq!(
        machine.begin_connect(guest(), Some(GuestState::Shutoff), None),
        Err(ConsoleGateError::NotRunning)
    );
    assert_eq!(
        machine.begin_connect(guest(), Some(GuestState::ShuttingDown), None),
        Err(ConsoleGateError::Transitional)
    );
    let p = pending(ActionKind::Start);
    assert_eq!(
        machine.begin_connect(guest(), Some(GuestState::Running), Some(&p)),
        Err(ConsoleGateError::ActionPending)
    );
    assert_eq!(machine.state(), SessionConnectionState::Idle);
}

#[test]
fn connect_gate_rejects_while_already_open() {
    let mut machine = ConsoleMachine::new();
    machine
        .begin_connect(guest(), Some(GuestState::Running), None)
        .unwrap();
    assert_eq!(
        machine.begin_connect(guest(), Some(GuestState::Running), None),
        Err(ConsoleGateError::Busy)
    );
}

#[test]
fn connect_then_negotiate_reaches_connected() {
    let mut machine = ConsoleMachine::new();
    let generation = machine
        .begin_connect(guest(), Some(GuestState::Blocked), None)
        .unwrap();
    assert_eq!(machine.state(), SessionConnectionState::Connecting);

    assert!(machine.on_connected(generation));
    assert_eq!(machine.state(), SessionConnectionState::Connected);
    assert_eq!(machine.view().error, None);
}

#[test]
fn close_invalidates_in_flight_attempts_and_events() {
    let mut machine = ConsoleMachine::new();
    let generation = machine
        .begin_connect(guest(), Some(GuestState::Running), None)
        .unwrap();
    machine.close();

    assert!(!machine.on_connected(generation));
    machine.on_transport_event(
        generation,
        TransportEvent::Fatal {
            reason: "stale".into(),
        },
    );
    assert_eq!(machine.state(), SessionConnectionState::Disconnected);
    assert_eq!(machine.view().error, None);
}

#[test]
fn transport_events_drive_terminal_states() {
    let mut machine = ConsoleMachine::new();
    let generation = machine
        .begin_connect(guest(), Some(GuestState::Running), None)
        .unwrap();
    machine.on_connected(generation);

    machine.on_transport_event(
        generation,
        TransportEvent::Disconnected {
            clean: false,
            reason: Some("guest went away".into()),
        },
    );
    assert_eq!(machine.state(), SessionConnectionState::Error);
    assert_eq!(machine.view().error.as_deref(), Some("guest went away"));

    // A later clean close from a fresh connection clears the error.
    let generation = {
        machine.close();
        machine
            .begin_connect(guest(), Some(GuestState::Running), None)
            .unwrap()
    };
    machine.on_connected(generation);
    machine.on_transport_event(
        generation,
        TransportEvent::Disconnected {
            clean: true,
            reason: None,
        },
    );
    assert_eq!(machine.state(), SessionConnectionState::Disconnected);
    assert_eq!(machine.view().error, None);
}

#[test]
fn unclean_close_without_reason_gets_a_fallback_message() {
    let mut machine = ConsoleMachine::new();
    let generation = machine
        .begin_connect(guest(), Some(GuestState::Running), None)
        .unwrap();
    machine.on_connected(generation);
    machine.on_transport_event(
        generation,
        TransportEvent::Disconnected {
            clean: false,
            reason: None,
        },
    );
    assert_eq!(machine.state(), SessionConnectionState::Error);
    assert!(machine.view().error.is_some());
}

#[test]
fn reconnect_arms_only_while_open_on_the_same_guest() {
    let mut machine = ConsoleMachine::new();

    // Not open: arming is a no-op.
    machine.arm_reconnect_if_open(&guest());
    assert!(!machine.wants_reconnect(&guest(), Some(GuestState::Running), None));

    let generation = machine
        .begin_connect(guest(), Some(GuestState::Running), None)
        .unwrap();
    machine.on_connected(generation);

    // Open, but a different guest restarted.
    machine.arm_reconnect_if_open(&GuestRef::new("h1", "other"));
    assert!(!machine.wants_reconnect(&guest(), Some(GuestState::Running), None));

    machine.arm_reconnect_if_open(&guest());
    assert!(machine.wants_reconnect(&guest(), Some(GuestState::Running), None));
}

#[test]
fn reconnect_predicate_requires_running_and_no_pending() {
    let mut machine = ConsoleMachine::new();
    let generation = machine
        .begin_connect(guest(), Some(GuestState::Running), None)
        .unwrap();
    machine.on_connected(generation);
    machine.arm_reconnect_if_open(&guest());

    assert!(!machine.wants_reconnect(&guest(), Some(GuestState::ShuttingDown), None));
    assert!(!machine.wants_reconnect(&guest(), None, None));
    let p = pending(ActionKind::Shutdown);
    assert!(!machine.wants_reconnect(&guest(), Some(GuestState::Running), Some(&p)));
    assert!(machine.wants_reconnect(&guest(), Some(GuestState::Running), None));
}

#[test]
fn begin_reconnect_consumes_the_armed_flag() {
    let mut machine = ConsoleMachine::new();
    let generation = machine
        .begin_connect(guest(), Some(GuestState::Running), None)
        .unwrap();
    machine.on_connected(generation);
    machine.arm_reconnect_if_open(&guest());

    let g = machine.begin_reconnect();
    assert_ne!(g, generation);
    assert_eq!(machine.state(), SessionConnectionState::Connecting);
    // At most one reconnect per completed action.
    assert!(!machine.wants_reconnect(&guest(), Some(GuestState::Running), None));
}

#[test]
fn reconnect_attempt_carries_a_fresh_generation() {
    let mut machine = ConsoleMachine::new();
    let old = machine
        .begin_connect(guest(), Some(GuestState::Running), None)
        .unwrap();
    machine.on_connected(old);
    machine.arm_reconnect_if_open(&guest());

    let fresh = machine.begin_reconnect();
    machine.on_connected(fresh);

    // The replaced connection's dying stream is a no-op.
    machine.on_transport_event(
        old,
        TransportEvent::Fatal {
            reason: "gone".into(),
        },
    );
    assert_eq!(machine.state(), SessionConnectionState::Connected);
    assert_eq!(machine.view().error, None);
}

#[test]
fn only_auto_attempt_failures_request_a_retry() {
    let mut machine = ConsoleMachine::new();
    let generation = machine
        .begin_connect(guest(), Some(GuestState::Running), None)
        .unwrap();

    // Manual attempt: failure waits for the user.
    assert!(!machine.on_connect_failed(generation, "refused".into()));
    assert_eq!(machine.state(), SessionConnectionState::Error);

    machine.arm_reconnect_if_open(&guest());
    let g = {
        // Re-open so the auto path is exercised.
        machine.close();
        let g = machine
            .begin_connect(guest(), Some(GuestState::Running), None)
            .unwrap();
        machine.on_connected(g);
        machine.arm_reconnect_if_open(&guest());
        machine.begin_reconnect()
    };
    assert!(machine.on_connect_failed(g, "refused".into()));
}

#[test]
fn begin_retry_is_generation_guarded() {
    let mut machine = ConsoleMachine::new();
    let g = machine
        .begin_connect(guest(), Some(GuestState::Running), None)
        .unwrap();
    machine.on_connected(g);
    machine.arm_reconnect_if_open(&guest());
    let g = machine.begin_reconnect();
    machine.on_connect_failed(g, "refused".into());

    let retry = machine.begin_retry(g).expect("retry under live generation");
    assert_ne!(retry, g);
    // The failed attempt's tag is now stale.
    assert_eq!(machine.begin_retry(g), None);

    machine.close();
    assert_eq!(machine.begin_retry(retry), None);
}
