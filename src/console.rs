// Console session state machine and restart auto-reconnect arming.
//
// The machine itself is synchronous; the engine owns the suspension points
// (credential creation, transport negotiation) and reports back here. A
// generation counter makes events and timers from a closed console no-ops.

use crate::models::{GuestRef, GuestState, SessionConnectionState, SessionView};
use crate::reconcile::PendingAction;
use crate::remote::TransportEvent;

/// Synchronous connect-gate rejection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsoleGateError {
    #[error("guest is not running")]
    NotRunning,
    #[error("guest is in a transitional state")]
    Transitional,
    #[error("a lifecycle action is pending for this guest")]
    ActionPending,
    #[error("a console session is already active")]
    Busy,
}

#[derive(Debug)]
pub struct ConsoleMachine {
    state: SessionConnectionState,
    guest: Option<GuestRef>,
    error: Option<String>,
    generation: u64,
    /// Set when start/reboot is dispatched while the console is open;
    /// consumed by the single reconnect attempt once that action clears.
    reconnect_armed: bool,
    /// The current attempt came from the auto-reconnect path; its failure
    /// schedules a backoff retry instead of waiting for the user.
    auto_attempt: bool,
}

impl ConsoleMachine {
    pub fn new() -> Self {
        Self {
            state: SessionConnectionState::Idle,
            guest: None,
            error: None,
            generation: 0,
            reconnect_armed: false,
            auto_attempt: false,
        }
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            state: self.state,
            guest: self.guest.clone(),
            error: self.error.clone(),
        }
    }

    pub fn state(&self) -> SessionConnectionState {
        self.state
    }

    pub fn guest(&self) -> Option<&GuestRef> {
        self.guest.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn is_open(&self) -> bool {
        matches!(
            self.state,
            SessionConnectionState::Connecting | SessionConnectionState::Connected
        )
    }

    /// User connect request. On success the machine is `connecting` and the
    /// returned generation tags the attempt the engine is about to spawn.
    pub fn begin_connect(
        &mut self,
        guest: GuestRef,
        observed: Option<GuestState>,
        pending: Option<&PendingAction>,
    ) -> Result<u64, ConsoleGateError> {
        if self.is_open() {
            return Err(ConsoleGateError::Busy);
        }
        let state = observed.ok_or(ConsoleGateError::NotRunning)?;
        if state.is_transitional() {
            return Err(ConsoleGateError::Transitional);
        }
        if !state.is_running_like() {
            return Err(ConsoleGateError::NotRunning);
        }
        if pending.is_some() {
            return Err(ConsoleGateError::ActionPending);
        }
        self.generation += 1;
        self.state = SessionConnectionState::Connecting;
        self.guest = Some(guest);
        self.error = None;
        self.auto_attempt = false;
        Ok(self.generation)
    }

    /// Arms the one-shot reconnect if `guest` has the console open and the
    /// dispatched action will restart it.
    pub fn arm_reconnect_if_open(&mut self, guest: &GuestRef) {
        if self.is_open() && self.guest.as_ref() == Some(guest) {
            self.reconnect_armed = true;
            tracing::debug!(guest = %guest, operation = "console", "auto-reconnect armed");
        }
    }

    /// The single "should reconnect" predicate, re-evaluated when either
    /// machine ticks: the restart action for our guest has cleared, the
    /// guest is confirmed running-like, and nothing else is pending.
    pub fn wants_reconnect(
        &self,
        cleared_guest: &GuestRef,
        observed: Option<GuestState>,
        pending: Option<&PendingAction>,
    ) -> bool {
        self.reconnect_armed
            && self.guest.as_ref() == Some(cleared_guest)
            && observed.is_some_and(GuestState::is_running_like)
            && pending.is_none()
    }

    /// Consumes the armed flag and starts an auto attempt under a fresh
    /// generation, so events from the connection being replaced are dropped.
    pub fn begin_reconnect(&mut self) -> u64 {
        self.reconnect_armed = false;
        self.auto_attempt = true;
        self.generation += 1;
        self.state = SessionConnectionState::Connecting;
        self.error = None;
        self.generation
    }

    /// Retry after a backoff-scheduled auto attempt failure. The failed
    /// attempt's tag must still be current; the retry gets its own.
    pub fn begin_retry(&mut self, generation: u64) -> Option<u64> {
        if generation != self.generation || self.guest.is_none() {
            return None;
        }
        self.auto_attempt = true;
        self.generation += 1;
        self.state = SessionConnectionState::Connecting;
        self.error = None;
        Some(self.generation)
    }

    /// Transport negotiation succeeded. Returns false for stale attempts.
    pub fn on_connected(&mut self, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        self.state = SessionConnectionState::Connected;
        self.error = None;
        self.auto_attempt = false;
        true
    }

    /// A (re)connect attempt failed before negotiation completed. Returns
    /// true when the engine should schedule a backoff retry.
    pub fn on_connect_failed(&mut self, generation: u64, reason: String) -> bool {
        if generation != self.generation {
            return false;
        }
        tracing::warn!(
            error = %reason,
            operation = "console_connect",
            "console connect attempt failed"
        );
        self.state = SessionConnectionState::Error;
        self.error = Some(reason);
        self.auto_attempt
    }

    /// Event from the live connection.
    pub fn on_transport_event(&mut self, generation: u64, event: TransportEvent) {
        if generation != self.generation {
            return;
        }
        match event {
            TransportEvent::Fatal { reason } => {
                self.state = SessionConnectionState::Error;
                self.error = Some(reason);
            }
            TransportEvent::Disconnected { clean: true, .. } => {
                self.state = SessionConnectionState::Disconnected;
                self.error = None;
            }
            TransportEvent::Disconnected { clean: false, reason } => {
                self.state = SessionConnectionState::Error;
                self.error = Some(reason.unwrap_or_else(|| "connection closed unexpectedly".into()));
            }
        }
    }

    /// Explicit close. Bumps the generation so in-flight attempts, live
    /// event streams, and scheduled retries all become no-ops.
    pub fn close(&mut self) {
        self.generation += 1;
        self.state = SessionConnectionState::Disconnected;
        self.guest = None;
        self.error = None;
        self.reconnect_armed = false;
        self.auto_attempt = false;
    }
}

impl Default for ConsoleMachine {
    fn default() -> Self {
        Self::new()
    }
}
