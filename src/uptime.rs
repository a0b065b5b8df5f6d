// Display-uptime projection: smooth, non-regressing counters between polls

use crate::inventory::GuestSnapshot;
use crate::models::{GuestRef, GuestState};
use std::collections::HashMap;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct UptimeTrack {
    /// Seconds of uptime as of `anchored_at`.
    base_secs: f64,
    anchored_at: Instant,
    last_state: GuestState,
}

impl UptimeTrack {
    /// Value of this track evaluated at `at`. Extrapolation applies only
    /// while the guest was last seen running-like; otherwise the base is
    /// frozen.
    fn projected(&self, at: Instant) -> f64 {
        if self.last_state.is_running_like() {
            self.base_secs + at.duration_since(self.anchored_at).as_secs_f64()
        } else {
            self.base_secs
        }
    }
}

/// Derives a smoothly advancing display uptime per guest from snapshots
/// plus elapsed wall time. Never regresses within one running segment,
/// even when the snapshot's underlying counter moves backwards; resets
/// only on an observed stop-to-start transition.
#[derive(Debug, Default)]
pub struct UptimeProjector {
    tracks: HashMap<GuestRef, UptimeTrack>,
}

impl UptimeProjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a new snapshot into the guest's track.
    pub fn observe(&mut self, guest: &GuestRef, snap: &GuestSnapshot) {
        let at = snap.fetched_at;
        let snapshot_base = snap.metrics.uptime_seconds as f64;

        let base_secs = match self.tracks.get(guest) {
            None => snapshot_base,
            Some(prev) => {
                if prev.last_state.is_stopped() && snap.state.is_running_like() {
                    // Observed stop-to-start transition: the counter legitimately reset.
                    snapshot_base
                } else {
                    snapshot_base.max(prev.projected(at))
                }
            }
        };

        self.tracks.insert(
            guest.clone(),
            UptimeTrack {
                base_secs,
                anchored_at: at,
                last_state: snap.state,
            },
        );
    }

    /// Current display value, or `None` when the guest is not running-like
    /// or has never been observed.
    pub fn display(&self, guest: &GuestRef, now: Instant) -> Option<u64> {
        let track = self.tracks.get(guest)?;
        if !track.last_state.is_running_like() {
            return None;
        }
        Some(track.projected(now) as u64)
    }

    /// Drops tracks for guests no longer present in the inventory.
    pub fn retain_known(&mut self, mut known: impl FnMut(&GuestRef) -> bool) {
        self.tracks.retain(|guest, _| known(guest));
    }
}
