// Force-off cooldown marks: time-boxed suppression of repeated force-offs

use crate::models::GuestRef;
use std::collections::HashMap;
use tokio::time::{Duration, Instant};

/// A mark covers one guest, or every guest when set by a bulk dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CooldownScope {
    Guest(GuestRef),
    Global,
}

/// Records *attempted* force-offs, not confirmed effect. While a mark is
/// unexpired, force-off eligibility is false for any guest it covers,
/// regardless of observed state.
#[derive(Debug)]
pub struct CooldownTable {
    window: Duration,
    marks: HashMap<CooldownScope, Instant>,
}

impl CooldownTable {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            marks: HashMap::new(),
        }
    }

    pub fn mark(&mut self, scope: CooldownScope, now: Instant) {
        self.marks.insert(scope, now);
    }

    /// True while a per-guest or global mark covering `guest` is unexpired.
    pub fn is_active(&self, guest: &GuestRef, now: Instant) -> bool {
        let live = |marked_at: &Instant| now.duration_since(*marked_at) < self.window;
        self.marks.get(&CooldownScope::Global).is_some_and(live)
            || self
                .marks
                .get(&CooldownScope::Guest(guest.clone()))
                .is_some_and(live)
    }

    /// Drops expired marks; wall-clock driven, independent of polling.
    pub fn purge_expired(&mut self, now: Instant) {
        let window = self.window;
        self.marks
            .retain(|_, marked_at| now.duration_since(*marked_at) < window);
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }
}
