// Pending-action tracking and reconciliation against polled snapshots.
//
// The completion policy is a single exhaustive match over the action kind;
// completion is decided from new snapshots and wall-clock timers, whichever
// produces local evidence of convergence first.

use crate::inventory::GuestSnapshot;
use crate::models::{ActionEligibility, ActionKind, GuestRef, GuestState};
use std::collections::HashMap;
use tokio::time::{Duration, Instant};

/// Local optimistic record of an in-flight lifecycle command.
#[derive(Debug, Clone)]
pub struct PendingAction {
    pub kind: ActionKind,
    pub started_at: Instant,
    /// Sticky once true: a non-running state was observed at least once
    /// since the reboot was issued.
    pub seen_intermediate: bool,
    /// Uptime counter captured at reboot-issue time.
    pub baseline_uptime_secs: Option<u64>,
}

/// Completion thresholds (empirical; configurable via `EngineConfig`).
#[derive(Debug, Clone, Copy)]
pub struct ReconcilePolicy {
    pub reboot_uptime_regress: Duration,
    pub reboot_fallback_timeout: Duration,
}

/// Why a pending action cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// The snapshot confirmed the commanded state.
    StateConfirmed,
    /// A running observation's uptime counter regressed past the baseline:
    /// the guest restarted even though polling never saw it down.
    CounterReset,
    /// Wall-clock bound expired; the overlay is removed regardless of
    /// observed state. A safety valve, not a failure.
    FallbackTimeout,
    /// The guest vanished from inventory (transient guests are unlisted
    /// once off).
    Vanished,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub guest: GuestRef,
    pub kind: ActionKind,
    pub reason: CompletionReason,
}

/// At most one live entry per guest. Mutated only inside the reconciliation
/// tick and dispatch-success handling; exposed read-only everywhere else.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<GuestRef, PendingAction>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a dispatched command. An existing entry is replaced, never
    /// stacked: a second reboot refreshes `started_at` and the baseline,
    /// and a force-off escalation supersedes a stuck graceful shutdown.
    pub fn record(
        &mut self,
        guest: GuestRef,
        kind: ActionKind,
        now: Instant,
        baseline_uptime_secs: Option<u64>,
    ) {
        self.entries.insert(
            guest,
            PendingAction {
                kind,
                started_at: now,
                seen_intermediate: false,
                baseline_uptime_secs: match kind {
                    ActionKind::Reboot => baseline_uptime_secs,
                    _ => None,
                },
            },
        );
    }

    pub fn get(&self, guest: &GuestRef) -> Option<&PendingAction> {
        self.entries.get(guest)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Applies the per-kind completion policy to every entry and removes
    /// the ones that cleared. Called on every applied poll and on every
    /// reconciliation tick, so timer-based completion makes progress even
    /// under polling starvation.
    pub fn reconcile<'a>(
        &mut self,
        mut snapshot_of: impl FnMut(&GuestRef) -> Option<&'a GuestSnapshot>,
        now: Instant,
        policy: ReconcilePolicy,
    ) -> Vec<Completion> {
        let mut completed = Vec::new();
        for (guest, entry) in self.entries.iter_mut() {
            if let Some(reason) = evaluate(entry, snapshot_of(guest), now, policy) {
                match reason {
                    CompletionReason::FallbackTimeout => tracing::warn!(
                        guest = %guest,
                        action = %entry.kind,
                        operation = "reconcile",
                        "pending action timed out; removing overlay without confirmation"
                    ),
                    _ => tracing::debug!(
                        guest = %guest,
                        action = %entry.kind,
                        reason = ?reason,
                        operation = "reconcile",
                        "pending action cleared"
                    ),
                }
                completed.push(Completion {
                    guest: guest.clone(),
                    kind: entry.kind,
                    reason,
                });
            }
        }
        for c in &completed {
            self.entries.remove(&c.guest);
        }
        completed
    }
}

fn evaluate(
    entry: &mut PendingAction,
    snap: Option<&GuestSnapshot>,
    now: Instant,
    policy: ReconcilePolicy,
) -> Option<CompletionReason> {
    match entry.kind {
        ActionKind::Start => snap
            .filter(|s| s.state.is_running_like())
            .map(|_| CompletionReason::StateConfirmed),
        ActionKind::Shutdown | ActionKind::ForceOff => match snap {
            Some(s) if s.state.is_stopped() => Some(CompletionReason::StateConfirmed),
            None => Some(CompletionReason::Vanished),
            _ => None,
        },
        ActionKind::Reboot => {
            // Polling may never observe the transient off period; three
            // rules race, first one wins.
            match snap {
                Some(s) if !s.state.is_running_like() => entry.seen_intermediate = true,
                None => entry.seen_intermediate = true,
                _ => {}
            }
            if let Some(s) = snap
                && s.state.is_running_like()
            {
                if entry.seen_intermediate {
                    return Some(CompletionReason::StateConfirmed);
                }
                if let Some(baseline) = entry.baseline_uptime_secs
                    && baseline.saturating_sub(s.metrics.uptime_seconds)
                        > policy.reboot_uptime_regress.as_secs()
                {
                    return Some(CompletionReason::CounterReset);
                }
            }
            if now.duration_since(entry.started_at) >= policy.reboot_fallback_timeout {
                return Some(CompletionReason::FallbackTimeout);
            }
            None
        }
    }
}

/// Effective display label: an optimistic overlay always takes precedence
/// over the snapshot-derived label.
pub fn effective_label(state: Option<GuestState>, pending: Option<&PendingAction>) -> &'static str {
    match pending {
        Some(p) => p.kind.overlay_label(),
        None => state.map_or("Unknown", GuestState::label),
    }
}

// Eligibility gates are advisory: the remote side is the authority, and
// dispatch is safe to attempt even when local state is stale.

pub fn can_start(state: Option<GuestState>, pending: Option<&PendingAction>) -> bool {
    pending.is_none() && state.is_some_and(GuestState::is_stopped)
}

pub fn can_shutdown(state: Option<GuestState>, pending: Option<&PendingAction>) -> bool {
    pending.is_none()
        && state.is_some_and(|s| s.is_running_like() || s == GuestState::Paused)
}

pub fn can_reboot(state: Option<GuestState>, pending: Option<&PendingAction>) -> bool {
    pending.is_none() && state.is_some_and(GuestState::is_running_like)
}

/// Force-off stays available while a graceful shutdown is pending, as the
/// escalation path for a stuck shutdown.
pub fn can_force_off(
    state: Option<GuestState>,
    pending: Option<&PendingAction>,
    cooldown_active: bool,
) -> bool {
    !cooldown_active
        && state.is_some_and(|s| !s.is_stopped())
        && pending.is_none_or(|p| p.kind == ActionKind::Shutdown)
}

pub fn eligibility(
    state: Option<GuestState>,
    pending: Option<&PendingAction>,
    cooldown_active: bool,
) -> ActionEligibility {
    ActionEligibility {
        can_start: can_start(state, pending),
        can_shutdown: can_shutdown(state, pending),
        can_reboot: can_reboot(state, pending),
        can_force_off: can_force_off(state, pending, cooldown_active),
    }
}

/// Bulk eligibility is the logical AND across the selection; an empty
/// selection is ineligible.
pub fn bulk_eligible(kind: ActionKind, rows: &[ActionEligibility]) -> bool {
    !rows.is_empty()
        && rows.iter().all(|e| match kind {
            ActionKind::Start => e.can_start,
            ActionKind::Shutdown => e.can_shutdown,
            ActionKind::Reboot => e.can_reboot,
            ActionKind::ForceOff => e.can_force_off,
        })
}
