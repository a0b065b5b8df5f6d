// The reconciliation engine: one event-loop task over polls, ticks,
// commands, and console events.
//
// All shared mutable state (snapshot store, pending-action table, cooldown
// marks, console machine) is owned by the loop and touched only between
// suspension points: network calls run in short spawned tasks that resolve
// into the internal event channel, so every read-modify-write completes
// within one synchronous turn.

use crate::config::EngineConfig;
use crate::console::{ConsoleGateError, ConsoleMachine};
use crate::cooldown::{CooldownScope, CooldownTable};
use crate::inventory::{InventoryStore, PollTicket};
use crate::models::{
    ActionEligibility, ActionKind, EngineView, GuestRef, GuestView, HostInventory,
};
use crate::reconcile::{self, PendingTable, ReconcilePolicy};
use crate::remote::{
    ConsoleBroker, ConsoleTransport, ControlPlane, InventorySource, RemoteError, TransportEvent,
};
use crate::uptime::UptimeProjector;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, interval};

/// Capacity for the internal event channel fed by spawned network tasks.
const INTERNAL_CHANNEL_CAPACITY: usize = 64;
/// Capacity for the handle's command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine stopped")]
    Closed,
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Gate(#[from] ConsoleGateError),
}

/// Builds the view broadcast channel at the configured capacity. Slow
/// subscribers lag rather than block the engine.
pub fn view_channel(
    config: &EngineConfig,
) -> (broadcast::Sender<EngineView>, broadcast::Receiver<EngineView>) {
    broadcast::channel(config.polling.broadcast_capacity)
}

/// Collaborators, output channel, and shutdown for the engine.
pub struct EngineDeps {
    pub source: Arc<dyn InventorySource>,
    pub control: Arc<dyn ControlPlane>,
    pub broker: Arc<dyn ConsoleBroker>,
    pub transport: Arc<dyn ConsoleTransport>,
    pub views_tx: broadcast::Sender<EngineView>,
    pub shutdown_rx: oneshot::Receiver<()>,
}

enum Command {
    Dispatch {
        guest: GuestRef,
        kind: ActionKind,
        reply: oneshot::Sender<Result<(), RemoteError>>,
    },
    DispatchBulk {
        kind: ActionKind,
        guests: Vec<GuestRef>,
        reply: oneshot::Sender<Vec<(GuestRef, Result<(), RemoteError>)>>,
    },
    /// Forced foreground poll; toggles the user-visible loading flag.
    Refresh,
    ConnectConsole {
        guest: GuestRef,
        reply: oneshot::Sender<Result<(), ConsoleGateError>>,
    },
    CloseConsole,
    View {
        reply: oneshot::Sender<EngineView>,
    },
}

enum Internal {
    PollDone {
        ticket: PollTicket,
        result: Result<HashMap<String, HostInventory>, RemoteError>,
    },
    DispatchDone {
        guest: GuestRef,
        kind: ActionKind,
        baseline_uptime_secs: Option<u64>,
        result: Result<(), RemoteError>,
        reply: oneshot::Sender<Result<(), RemoteError>>,
    },
    BulkDispatchDone {
        kind: ActionKind,
        outcomes: Vec<(GuestRef, Option<u64>, Result<(), RemoteError>)>,
        reply: oneshot::Sender<Vec<(GuestRef, Result<(), RemoteError>)>>,
    },
    ConsoleConnected {
        generation: u64,
    },
    ConsoleFailed {
        generation: u64,
        reason: String,
    },
    ConsoleEvent {
        generation: u64,
        event: TransportEvent,
    },
    ReconnectDue {
        generation: u64,
    },
}

/// Cloneable entry point for the surrounding UI.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::Sender<Command>,
    views_tx: broadcast::Sender<EngineView>,
}

impl EngineHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<EngineView> {
        self.views_tx.subscribe()
    }

    /// Sends a lifecycle command. `Ok` means accepted by the remote and a
    /// pending overlay recorded; errors carry the remote detail verbatim.
    pub async fn dispatch(&self, guest: GuestRef, kind: ActionKind) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Dispatch { guest, kind, reply })
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await
            .map_err(|_| EngineError::Closed)?
            .map_err(EngineError::Remote)
    }

    /// Dispatches one lifecycle command to every guest in the selection.
    /// Outcomes are returned in selection order; an accepted bulk force-off
    /// marks a global cooldown covering every guest.
    pub async fn dispatch_bulk(
        &self,
        kind: ActionKind,
        selection: &[GuestRef],
    ) -> Result<Vec<(GuestRef, Result<(), RemoteError>)>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::DispatchBulk {
                kind,
                guests: selection.to_vec(),
                reply,
            })
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    /// Requests an immediate foreground poll.
    pub async fn refresh(&self) -> Result<(), EngineError> {
        self.cmd_tx
            .send(Command::Refresh)
            .await
            .map_err(|_| EngineError::Closed)
    }

    pub async fn view(&self) -> Result<EngineView, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::View { reply })
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    /// Bulk eligibility over a selection: the AND of per-guest eligibility.
    /// Guests without a snapshot are ineligible for everything.
    pub async fn bulk_eligible(
        &self,
        kind: ActionKind,
        selection: &[GuestRef],
    ) -> Result<bool, EngineError> {
        let view = self.view().await?;
        let rows: Vec<ActionEligibility> = selection
            .iter()
            .map(|guest| {
                view.guests
                    .iter()
                    .find(|v| &v.guest == guest)
                    .map(|v| v.eligibility)
                    .unwrap_or_default()
            })
            .collect();
        Ok(reconcile::bulk_eligible(kind, &rows))
    }

    /// Opens a console session. The gate result is immediate; connection
    /// progress is reported through the view stream.
    pub async fn connect_console(&self, guest: GuestRef) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ConnectConsole { guest, reply })
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await
            .map_err(|_| EngineError::Closed)?
            .map_err(EngineError::Gate)
    }

    pub async fn close_console(&self) -> Result<(), EngineError> {
        self.cmd_tx
            .send(Command::CloseConsole)
            .await
            .map_err(|_| EngineError::Closed)
    }
}

struct EngineCore {
    config: EngineConfig,
    source: Arc<dyn InventorySource>,
    control: Arc<dyn ControlPlane>,
    broker: Arc<dyn ConsoleBroker>,
    transport: Arc<dyn ConsoleTransport>,
    views_tx: broadcast::Sender<EngineView>,
    internal_tx: mpsc::Sender<Internal>,
    store: InventoryStore,
    projector: UptimeProjector,
    pending: PendingTable,
    cooldowns: CooldownTable,
    console: ConsoleMachine,
}

/// Spawns the engine task. The returned handle is the UI's entry point;
/// the join handle completes after shutdown is signalled or every handle
/// is dropped.
pub fn spawn(deps: EngineDeps, config: EngineConfig) -> (EngineHandle, tokio::task::JoinHandle<()>) {
    let EngineDeps {
        source,
        control,
        broker,
        transport,
        views_tx,
        mut shutdown_rx,
    } = deps;

    let (cmd_tx, mut cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let (internal_tx, mut internal_rx) = mpsc::channel(INTERNAL_CHANNEL_CAPACITY);

    let handle = EngineHandle {
        cmd_tx,
        views_tx: views_tx.clone(),
    };

    let mut core = EngineCore {
        cooldowns: CooldownTable::new(config.force_off_cooldown()),
        config,
        source,
        control,
        broker,
        transport,
        views_tx,
        internal_tx,
        store: InventoryStore::new(),
        projector: UptimeProjector::new(),
        pending: PendingTable::new(),
        console: ConsoleMachine::new(),
    };

    let join = tokio::spawn(async move {
        let mut poll_tick = interval(core.config.poll_interval());
        poll_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut refresh_tick = interval(core.config.refresh_interval());
        refresh_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = poll_tick.tick() => {
                    // Background poll: silent, coalesced with any in flight.
                    core.start_poll(false, false);
                }
                _ = refresh_tick.tick() => {
                    let now = Instant::now();
                    core.run_reconcile(now);
                    core.publish(now);
                }
                internal = internal_rx.recv() => {
                    match internal {
                        Some(ev) => core.handle_internal(ev),
                        None => break,
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(c) => core.handle_command(c),
                        None => {
                            tracing::debug!("all engine handles dropped; stopping");
                            break;
                        }
                    }
                }
                _ = &mut shutdown_rx => {
                    tracing::debug!("Engine shutting down");
                    break;
                }
            }
        }
    });

    (handle, join)
}

impl EngineCore {
    fn policy(&self) -> ReconcilePolicy {
        ReconcilePolicy {
            reboot_uptime_regress: self.config.reboot_uptime_regress(),
            reboot_fallback_timeout: self.config.reboot_fallback_timeout(),
        }
    }

    fn start_poll(&mut self, foreground: bool, force: bool) {
        let Some(ticket) = self.store.begin_poll(foreground, force) else {
            return;
        };
        let source = self.source.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = source.fetch().await;
            // The loop may be gone; a closed channel makes this a no-op.
            let _ = tx.send(Internal::PollDone { ticket, result }).await;
        });
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Dispatch { guest, kind, reply } => {
                // Local eligibility is advisory; the remote is the
                // authority, so the attempt always goes out.
                let baseline_uptime_secs = self
                    .store
                    .snapshot(&guest)
                    .map(|s| s.metrics.uptime_seconds);
                let control = self.control.clone();
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = control.lifecycle(&guest, kind).await;
                    let _ = tx
                        .send(Internal::DispatchDone {
                            guest,
                            kind,
                            baseline_uptime_secs,
                            result,
                            reply,
                        })
                        .await;
                });
            }
            Command::DispatchBulk { kind, guests, reply } => {
                let targets: Vec<(GuestRef, Option<u64>)> = guests
                    .into_iter()
                    .map(|guest| {
                        let baseline = self
                            .store
                            .snapshot(&guest)
                            .map(|s| s.metrics.uptime_seconds);
                        (guest, baseline)
                    })
                    .collect();
                let control = self.control.clone();
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let mut outcomes = Vec::with_capacity(targets.len());
                    for (guest, baseline) in targets {
                        let result = control.lifecycle(&guest, kind).await;
                        outcomes.push((guest, baseline, result));
                    }
                    let _ = tx
                        .send(Internal::BulkDispatchDone {
                            kind,
                            outcomes,
                            reply,
                        })
                        .await;
                });
            }
            Command::Refresh => {
                self.start_poll(true, true);
                self.publish(Instant::now());
            }
            Command::ConnectConsole { guest, reply } => {
                let observed = self.store.snapshot(&guest).map(|s| s.state);
                let pending = self.pending.get(&guest);
                match self.console.begin_connect(guest.clone(), observed, pending) {
                    Ok(generation) => {
                        let _ = reply.send(Ok(()));
                        self.spawn_console_attempt(generation, guest);
                    }
                    Err(gate) => {
                        let _ = reply.send(Err(gate));
                    }
                }
                self.publish(Instant::now());
            }
            Command::CloseConsole => {
                self.console.close();
                self.publish(Instant::now());
            }
            Command::View { reply } => {
                let _ = reply.send(self.build_view(Instant::now()));
            }
        }
    }

    fn handle_internal(&mut self, ev: Internal) {
        let now = Instant::now();
        match ev {
            Internal::PollDone { ticket, result } => {
                if self.store.apply_result(ticket, result, now) {
                    let (projector, store) = (&mut self.projector, &self.store);
                    projector.retain_known(|guest| store.snapshot(guest).is_some());
                    for (guest, snap) in store.iter() {
                        projector.observe(guest, snap);
                    }
                    self.run_reconcile(now);
                }
                self.publish(now);
            }
            Internal::DispatchDone {
                guest,
                kind,
                baseline_uptime_secs,
                result,
                reply,
            } => {
                match &result {
                    Ok(()) => {
                        self.pending
                            .record(guest.clone(), kind, now, baseline_uptime_secs);
                        if kind == ActionKind::ForceOff {
                            self.cooldowns.mark(CooldownScope::Guest(guest.clone()), now);
                        }
                        if matches!(kind, ActionKind::Start | ActionKind::Reboot) {
                            self.console.arm_reconnect_if_open(&guest);
                        }
                        tracing::debug!(
                            guest = %guest,
                            action = %kind,
                            operation = "dispatch",
                            "lifecycle command accepted"
                        );
                    }
                    Err(e) => {
                        // Dispatch failure leaves any existing pending
                        // action untouched.
                        tracing::warn!(
                            guest = %guest,
                            action = %kind,
                            error = %e,
                            operation = "dispatch",
                            "lifecycle command failed"
                        );
                    }
                }
                let _ = reply.send(result);
                self.publish(now);
            }
            Internal::BulkDispatchDone {
                kind,
                outcomes,
                reply,
            } => {
                let mut results = Vec::with_capacity(outcomes.len());
                let mut any_accepted = false;
                for (guest, baseline, result) in outcomes {
                    match &result {
                        Ok(()) => {
                            any_accepted = true;
                            self.pending.record(guest.clone(), kind, now, baseline);
                            if matches!(kind, ActionKind::Start | ActionKind::Reboot) {
                                self.console.arm_reconnect_if_open(&guest);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                guest = %guest,
                                action = %kind,
                                error = %e,
                                operation = "dispatch",
                                "bulk lifecycle command failed"
                            );
                        }
                    }
                    results.push((guest, result));
                }
                if any_accepted && kind == ActionKind::ForceOff {
                    self.cooldowns.mark(CooldownScope::Global, now);
                }
                let _ = reply.send(results);
                self.publish(now);
            }
            Internal::ConsoleConnected { generation } => {
                if self.console.on_connected(generation) {
                    tracing::debug!(operation = "console", "console connected");
                }
                self.publish(now);
            }
            Internal::ConsoleFailed { generation, reason } => {
                if self.console.on_connect_failed(generation, reason) {
                    self.schedule_reconnect_retry(generation);
                }
                self.publish(now);
            }
            Internal::ConsoleEvent { generation, event } => {
                self.console.on_transport_event(generation, event);
                self.publish(now);
            }
            Internal::ReconnectDue { generation } => {
                if let Some(generation) = self.console.begin_retry(generation)
                    && let Some(guest) = self.console.guest().cloned()
                {
                    self.spawn_console_attempt(generation, guest);
                }
                self.publish(now);
            }
        }
    }

    /// Evaluates the pending table against the latest snapshots and
    /// wall-clock timers, then re-evaluates the console reconnect watcher.
    ///
    /// The armed reconnect is checked on every pass, not only at the
    /// instant a completion fires: a fallback-cleared reboot may see the
    /// guest running again only several polls later.
    fn run_reconcile(&mut self, now: Instant) {
        self.cooldowns.purge_expired(now);
        let policy = self.policy();
        let (pending, store) = (&mut self.pending, &self.store);
        pending.reconcile(|guest| store.snapshot(guest), now, policy);

        if let Some(guest) = self.console.guest().cloned() {
            let observed = self.store.snapshot(&guest).map(|s| s.state);
            let still_pending = self.pending.get(&guest);
            if self.console.wants_reconnect(&guest, observed, still_pending) {
                let generation = self.console.begin_reconnect();
                tracing::debug!(
                    guest = %guest,
                    operation = "console",
                    "reconnecting console after completed restart"
                );
                self.spawn_console_attempt(generation, guest);
            }
        }
    }

    /// One (re)connect attempt: a fresh single-use credential, an expiry
    /// check, then transport negotiation. The task forwards connection
    /// events until the stream ends; a stream that ends without a terminal
    /// event is reported as an unexpected close.
    fn spawn_console_attempt(&self, generation: u64, guest: GuestRef) {
        let broker = self.broker.clone();
        let transport = self.transport.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let session = match broker.create_session(&guest).await {
                Ok(s) => s,
                Err(e) => {
                    let _ = tx
                        .send(Internal::ConsoleFailed {
                            generation,
                            reason: e.to_string(),
                        })
                        .await;
                    return;
                }
            };

            let now_ms = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            if session.expires_at_ms <= now_ms {
                let _ = tx
                    .send(Internal::ConsoleFailed {
                        generation,
                        reason: "console ticket expired before use".into(),
                    })
                    .await;
                return;
            }

            let mut events = match transport
                .connect(&session.websocket_path, &session.password)
                .await
            {
                Ok(rx) => rx,
                Err(e) => {
                    let _ = tx
                        .send(Internal::ConsoleFailed {
                            generation,
                            reason: e.to_string(),
                        })
                        .await;
                    return;
                }
            };

            let _ = tx.send(Internal::ConsoleConnected { generation }).await;

            let mut saw_terminal = false;
            while let Some(event) = events.recv().await {
                saw_terminal = matches!(
                    event,
                    TransportEvent::Fatal { .. } | TransportEvent::Disconnected { .. }
                );
                let _ = tx.send(Internal::ConsoleEvent { generation, event }).await;
                if saw_terminal {
                    break;
                }
            }
            if !saw_terminal {
                let _ = tx
                    .send(Internal::ConsoleEvent {
                        generation,
                        event: TransportEvent::Fatal {
                            reason: "console transport closed unexpectedly".into(),
                        },
                    })
                    .await;
            }
        });
    }

    /// Retry the auto-reconnect after the fixed backoff, tagged with the
    /// attempt generation so a closed console never reconnects.
    fn schedule_reconnect_retry(&self, generation: u64) {
        let backoff = self.config.reconnect_backoff();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = tx.send(Internal::ReconnectDue { generation }).await;
        });
    }

    fn build_view(&self, now: Instant) -> EngineView {
        let mut guests: Vec<GuestView> = self
            .store
            .iter()
            .map(|(guest, snap)| {
                let pending = self.pending.get(guest);
                GuestView {
                    guest: guest.clone(),
                    state: snap.state,
                    label: reconcile::effective_label(Some(snap.state), pending).to_string(),
                    pending: pending.map(|p| p.kind),
                    display_uptime_secs: self.projector.display(guest, now),
                    eligibility: reconcile::eligibility(
                        Some(snap.state),
                        pending,
                        self.cooldowns.is_active(guest, now),
                    ),
                    persistent: snap.persistent,
                    host_error: self.store.host_error(&guest.host).map(str::to_owned),
                }
            })
            .collect();
        guests.sort_by(|a, b| {
            (&a.guest.host, &a.guest.name).cmp(&(&b.guest.host, &b.guest.name))
        });
        EngineView {
            guests,
            host_errors: self
                .store
                .host_errors()
                .map(|(host, err)| (host.to_owned(), err.to_owned()))
                .collect(),
            loading: self.store.loading(),
            session: self.console.view(),
        }
    }

    fn publish(&self, now: Instant) {
        // No receivers is fine; the UI may not be subscribed yet.
        let _ = self.views_tx.send(self.build_view(now));
    }
}
