// Shared test helpers: builders and scripted collaborators
#![allow(dead_code)]

use async_trait::async_trait;
use guestdeck::config::EngineConfig;
use guestdeck::engine::{self, EngineDeps, EngineHandle};
use guestdeck::models::*;
use guestdeck::remote::*;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

pub fn metrics(uptime_seconds: u64) -> GuestMetrics {
    GuestMetrics {
        vcpu_count: 2,
        memory_mb: 2048,
        max_memory_mb: 4096,
        cpu_time_seconds: uptime_seconds as f64,
        uptime_seconds,
    }
}

pub fn observation(name: &str, state: GuestState, uptime_seconds: u64) -> GuestObservation {
    GuestObservation {
        name: name.into(),
        state,
        metrics: metrics(uptime_seconds),
        persistent: true,
    }
}

pub fn host_with(guests: Vec<GuestObservation>) -> HostInventory {
    HostInventory {
        guests,
        error: None,
    }
}

pub fn host_error(msg: &str) -> HostInventory {
    HostInventory {
        guests: vec![],
        error: Some(msg.into()),
    }
}

/// One host ("h1") with one guest.
pub fn single_guest(name: &str, state: GuestState, uptime: u64) -> HashMap<String, HostInventory> {
    HashMap::from([("h1".to_string(), host_with(vec![observation(name, state, uptime)]))])
}

pub fn guest(name: &str) -> GuestRef {
    GuestRef::new("h1", name)
}

pub struct MockSource {
    response: Mutex<Result<HashMap<String, HostInventory>, RemoteError>>,
    pub calls: AtomicUsize,
}

impl MockSource {
    pub fn with(inventory: HashMap<String, HostInventory>) -> Arc<Self> {
        Arc::new(Self {
            response: Mutex::new(Ok(inventory)),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, inventory: HashMap<String, HostInventory>) {
        *self.response.lock().unwrap() = Ok(inventory);
    }

    pub fn fail(&self, msg: &str) {
        *self.response.lock().unwrap() = Err(RemoteError::Transport(msg.into()));
    }
}

#[async_trait]
impl InventorySource for MockSource {
    async fn fetch(&self) -> Result<HashMap<String, HostInventory>, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.response.lock().unwrap().clone()
    }
}

pub struct MockControl {
    result: Mutex<Result<(), RemoteError>>,
    pub calls: Mutex<Vec<(GuestRef, ActionKind)>>,
}

impl MockControl {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(Ok(())),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn reject(&self, detail: &str) {
        *self.result.lock().unwrap() = Err(RemoteError::Rejected(detail.into()));
    }

    pub fn accept(&self) {
        *self.result.lock().unwrap() = Ok(());
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ControlPlane for MockControl {
    async fn lifecycle(&self, guest: &GuestRef, action: ActionKind) -> Result<(), RemoteError> {
        self.calls.lock().unwrap().push((guest.clone(), action));
        self.result.lock().unwrap().clone()
    }
}

pub struct MockBroker {
    pub calls: AtomicUsize,
    fail: Mutex<Option<RemoteError>>,
    /// Epoch-ms expiry applied to issued tickets; far future by default.
    expires_at_ms: Mutex<Option<u64>>,
}

impl MockBroker {
    pub fn issuing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: Mutex::new(None),
            expires_at_ms: Mutex::new(None),
        })
    }

    pub fn fail_with(&self, msg: &str) {
        *self.fail.lock().unwrap() = Some(RemoteError::Rejected(msg.into()));
    }

    pub fn expire_tickets_at(&self, epoch_ms: u64) {
        *self.expires_at_ms.lock().unwrap() = Some(epoch_ms);
    }
}

#[async_trait]
impl ConsoleBroker for MockBroker {
    async fn create_session(&self, _guest: &GuestRef) -> Result<ConsoleSession, RemoteError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(err) = self.fail.lock().unwrap().clone() {
            return Err(err);
        }
        let expires_at_ms = self.expires_at_ms.lock().unwrap().unwrap_or_else(|| {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_millis() as u64
                + 60_000
        });
        Ok(ConsoleSession {
            token: format!("ticket-{n}"),
            password: format!("secret-{n}"),
            websocket_path: format!("/console/ws/{n}"),
            expires_at_ms,
        })
    }
}

pub struct MockTransport {
    /// Outcome per connect attempt, in order; exhausted entries succeed.
    script: Mutex<VecDeque<Result<(), RemoteError>>>,
    pub connects: Mutex<Vec<(String, String)>>,
    /// Event senders for established connections, oldest first.
    event_txs: Mutex<Vec<mpsc::Sender<TransportEvent>>>,
}

impl MockTransport {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            connects: Mutex::new(Vec::new()),
            event_txs: Mutex::new(Vec::new()),
        })
    }

    pub fn script_next(&self, outcome: Result<(), RemoteError>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().unwrap().len()
    }

    /// Drops connection `index`'s event sender, ending its stream without a
    /// terminal event.
    pub fn drop_connection(&self, index: usize) {
        self.event_txs.lock().unwrap().remove(index);
    }

    /// Emits an event on the most recent live connection.
    pub async fn emit(&self, event: TransportEvent) {
        let tx = self
            .event_txs
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no live connection");
        tx.send(event).await.expect("event channel closed");
    }
}

#[async_trait]
impl ConsoleTransport for MockTransport {
    async fn connect(
        &self,
        websocket_path: &str,
        password: &str,
    ) -> Result<mpsc::Receiver<TransportEvent>, RemoteError> {
        self.connects
            .lock()
            .unwrap()
            .push((websocket_path.to_string(), password.to_string()));
        if let Some(outcome) = self.script.lock().unwrap().pop_front() {
            outcome?;
        }
        let (tx, rx) = mpsc::channel(8);
        self.event_txs.lock().unwrap().push(tx);
        Ok(rx)
    }
}

pub struct Harness {
    pub handle: EngineHandle,
    pub views: broadcast::Receiver<EngineView>,
    pub source: Arc<MockSource>,
    pub control: Arc<MockControl>,
    pub broker: Arc<MockBroker>,
    pub transport: Arc<MockTransport>,
    pub shutdown_tx: oneshot::Sender<()>,
    pub join: tokio::task::JoinHandle<()>,
}

pub fn spawn_engine(inventory: HashMap<String, HostInventory>) -> Harness {
    spawn_engine_with_config(inventory, EngineConfig::default())
}

pub fn spawn_engine_with_config(
    inventory: HashMap<String, HostInventory>,
    config: EngineConfig,
) -> Harness {
    let source = MockSource::with(inventory);
    let control = MockControl::accepting();
    let broker = MockBroker::issuing();
    let transport = MockTransport::accepting();
    let (views_tx, views) = engine::view_channel(&config);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let (handle, join) = engine::spawn(
        EngineDeps {
            source: source.clone(),
            control: control.clone(),
            broker: broker.clone(),
            transport: transport.clone(),
            views_tx,
            shutdown_rx,
        },
        config,
    );

    Harness {
        handle,
        views,
        source,
        control,
        broker,
        transport,
        shutdown_tx,
        join,
    }
}

/// Lets the engine task drain everything that is ready. Under paused time a
/// 1ms sleep only fires once every other task is idle.
pub async fn settle() {
    tokio::time::sleep(tokio::time::Duration::from_millis(1)).await;
}
