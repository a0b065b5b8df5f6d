// Domain models: inventory wire rows and UI-facing view projections

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Immutable guest identity: `(host, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestRef {
    pub host: String,
    pub name: String,
}

impl GuestRef {
    pub fn new(host: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for GuestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.name)
    }
}

/// Observed guest state; serializes to kebab-case JSON (e.g. "shutting-down").
/// Aliases accept the hypervisor's own spellings on the way in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GuestState {
    Running,
    Blocked,
    Paused,
    #[serde(alias = "shutdown")]
    ShuttingDown,
    #[serde(alias = "shut off")]
    Shutoff,
    Crashed,
    #[serde(alias = "pmsuspended")]
    Suspended,
    #[serde(other)]
    Unknown,
}

impl GuestState {
    /// Running or blocked-on-resource; the guest is up either way.
    pub fn is_running_like(self) -> bool {
        matches!(self, GuestState::Running | GuestState::Blocked)
    }

    /// Terminal stopped states.
    pub fn is_stopped(self) -> bool {
        matches!(self, GuestState::Shutoff | GuestState::Crashed)
    }

    /// In-flight hypervisor transition; lifecycle gates treat it as busy.
    pub fn is_transitional(self) -> bool {
        matches!(self, GuestState::ShuttingDown)
    }

    /// Snapshot-derived label, used when no action overlay is present.
    pub fn label(self) -> &'static str {
        match self {
            GuestState::Running => "Running",
            GuestState::Blocked => "Running",
            GuestState::Paused => "Paused",
            GuestState::ShuttingDown => "Shutting down",
            GuestState::Shutoff => "Shut off",
            GuestState::Crashed => "Crashed",
            GuestState::Suspended => "Suspended",
            GuestState::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestMetrics {
    pub vcpu_count: u32,
    pub memory_mb: u64,
    pub max_memory_mb: u64,
    pub cpu_time_seconds: f64,
    pub uptime_seconds: u64,
}

/// One wire row of an inventory fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestObservation {
    pub name: String,
    pub state: GuestState,
    pub metrics: GuestMetrics,
    /// Transient (non-persistent) guests are unlisted once off.
    pub persistent: bool,
}

/// Per-host slice of an inventory fetch: either rows or a host-scoped error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInventory {
    #[serde(default)]
    pub guests: Vec<GuestObservation>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Lifecycle command kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    Start,
    Shutdown,
    Reboot,
    ForceOff,
}

impl ActionKind {
    /// Wire value for the lifecycle command endpoint body.
    pub fn as_remote(self) -> &'static str {
        match self {
            ActionKind::Start => "start",
            ActionKind::Shutdown => "shutdown",
            ActionKind::Reboot => "reboot",
            ActionKind::ForceOff => "force-off",
        }
    }

    /// Optimistic overlay label shown while the action is pending.
    pub fn overlay_label(self) -> &'static str {
        match self {
            ActionKind::Start => "Powering on",
            ActionKind::Shutdown => "Shutting down",
            ActionKind::Reboot => "Rebooting",
            ActionKind::ForceOff => "Powering off",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_remote())
    }
}

/// Single-use console credential. Field names follow the remote wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleSession {
    pub token: String,
    pub password: String,
    pub websocket_path: String,
    /// Unix epoch milliseconds.
    pub expires_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionConnectionState {
    Idle,
    Connecting,
    Connected,
    Error,
    Disconnected,
}

/// Per-action eligibility booleans for one guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionEligibility {
    pub can_start: bool,
    pub can_shutdown: bool,
    pub can_reboot: bool,
    pub can_force_off: bool,
}

/// Per-guest UI projection: observed state with the action overlay applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestView {
    pub guest: GuestRef,
    pub state: GuestState,
    /// Effective label; a pending action overrides the snapshot label.
    pub label: String,
    pub pending: Option<ActionKind>,
    pub display_uptime_secs: Option<u64>,
    pub eligibility: ActionEligibility,
    pub persistent: bool,
    pub host_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub state: SessionConnectionState,
    pub guest: Option<GuestRef>,
    pub error: Option<String>,
}

/// Full engine projection broadcast to subscribers after each applied turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineView {
    pub guests: Vec<GuestView>,
    /// Host-scoped fetch errors, covering hosts with no guest rows yet.
    pub host_errors: HashMap<String, String>,
    /// True only while a foreground (user-requested) poll is in flight.
    pub loading: bool,
    pub session: SessionView,
}
