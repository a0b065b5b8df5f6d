// Inventory snapshot store: poll sequencing, host-scoped errors, staleness guards

use crate::models::{GuestMetrics, GuestRef, GuestState, HostInventory};
use crate::remote::RemoteError;
use std::collections::HashMap;
use tokio::time::Instant;

/// Latest observed state for one guest. Replaced wholesale on each applied
/// poll; never partially patched.
#[derive(Debug, Clone)]
pub struct GuestSnapshot {
    pub state: GuestState,
    pub metrics: GuestMetrics,
    pub persistent: bool,
    pub fetched_at: Instant,
}

/// Handed out by `begin_poll`; identifies one in-flight fetch.
#[derive(Debug, Clone, Copy)]
pub struct PollTicket {
    pub seq: u64,
    pub foreground: bool,
}

/// Owns the authoritative snapshot map. Poll responses are applied in
/// sequence order: a response older than the last applied one is dropped,
/// so late replies never roll back fresher state.
#[derive(Debug, Default)]
pub struct InventoryStore {
    snapshots: HashMap<GuestRef, GuestSnapshot>,
    host_errors: HashMap<String, String>,
    next_seq: u64,
    last_applied_seq: u64,
    in_flight: usize,
    foreground_in_flight: usize,
}

impl InventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new poll. Returns `None` when one is already in flight
    /// and the caller did not force; a forced poll may overlap (the
    /// sequence guard keeps application ordered).
    pub fn begin_poll(&mut self, foreground: bool, force: bool) -> Option<PollTicket> {
        if self.in_flight > 0 && !force {
            return None;
        }
        self.next_seq += 1;
        self.in_flight += 1;
        if foreground {
            self.foreground_in_flight += 1;
        }
        Some(PollTicket {
            seq: self.next_seq,
            foreground,
        })
    }

    /// Folds a completed poll into the store. Returns true when the result
    /// was applied (i.e. it was not stale and it succeeded).
    pub fn apply_result(
        &mut self,
        ticket: PollTicket,
        result: Result<HashMap<String, HostInventory>, RemoteError>,
        now: Instant,
    ) -> bool {
        self.in_flight = self.in_flight.saturating_sub(1);
        if ticket.foreground {
            self.foreground_in_flight = self.foreground_in_flight.saturating_sub(1);
        }

        let inventory = match result {
            Ok(inv) => inv,
            Err(e) => {
                // Prior snapshots stay valid; stale beats empty.
                tracing::warn!(
                    error = %e,
                    operation = "poll_inventory",
                    seq = ticket.seq,
                    "inventory poll failed; keeping previous snapshots"
                );
                return false;
            }
        };

        if ticket.seq <= self.last_applied_seq {
            tracing::debug!(
                operation = "poll_inventory",
                seq = ticket.seq,
                last_applied = self.last_applied_seq,
                "dropping stale poll response"
            );
            return false;
        }
        self.last_applied_seq = ticket.seq;

        for (host, slice) in inventory {
            if let Some(err) = slice.error {
                // Host-scoped failure: keep that host's snapshots, record the error.
                self.host_errors.insert(host, err);
                continue;
            }
            self.host_errors.remove(&host);
            self.snapshots.retain(|guest, _| guest.host != host);
            for obs in slice.guests {
                self.snapshots.insert(
                    GuestRef::new(host.clone(), obs.name),
                    GuestSnapshot {
                        state: obs.state,
                        metrics: obs.metrics,
                        persistent: obs.persistent,
                        fetched_at: now,
                    },
                );
            }
        }
        true
    }

    /// True only while a foreground (user-requested) poll is in flight;
    /// background polls never toggle this.
    pub fn loading(&self) -> bool {
        self.foreground_in_flight > 0
    }

    pub fn snapshot(&self, guest: &GuestRef) -> Option<&GuestSnapshot> {
        self.snapshots.get(guest)
    }

    pub fn host_error(&self, host: &str) -> Option<&str> {
        self.host_errors.get(host).map(String::as_str)
    }

    pub fn host_errors(&self) -> impl Iterator<Item = (&str, &str)> {
        self.host_errors
            .iter()
            .map(|(host, err)| (host.as_str(), err.as_str()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GuestRef, &GuestSnapshot)> {
        self.snapshots.iter()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}
