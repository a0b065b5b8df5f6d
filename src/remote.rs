// Collaborator seams: inventory fetch, lifecycle commands, console sessions

use crate::models::{ActionKind, ConsoleSession, GuestRef, HostInventory};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Error taxonomy for remote calls.
///
/// `Rejected` carries the remote detail verbatim; `Transport` covers
/// network-level failures and aborts.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("{0}")]
    Rejected(String),
}

impl RemoteError {
    /// Builds a rejection from a non-2xx response body.
    ///
    /// The control plane returns `detail` as either a plain string or an
    /// object carrying `message`; both are surfaced verbatim. Anything else
    /// falls back to the status line.
    pub fn rejected_from_body(status: u16, body: &serde_json::Value) -> Self {
        let detail = body.get("detail").and_then(|d| {
            d.as_str()
                .map(str::to_owned)
                .or_else(|| d.get("message").and_then(|m| m.as_str()).map(str::to_owned))
        });
        match detail {
            Some(msg) if !msg.is_empty() => RemoteError::Rejected(msg),
            _ => RemoteError::Rejected(format!("request failed with status {status}")),
        }
    }
}

/// Full-inventory snapshot fetch. One call returns every known host;
/// per-host failures are reported inside `HostInventory::error` rather than
/// failing the whole call.
#[async_trait]
pub trait InventorySource: Send + Sync {
    async fn fetch(&self) -> Result<HashMap<String, HostInventory>, RemoteError>;
}

/// Lifecycle command endpoint. `Ok` means the command was *accepted*,
/// never that it completed.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn lifecycle(&self, guest: &GuestRef, action: ActionKind) -> Result<(), RemoteError>;
}

/// Issues single-use, expiry-bearing console credentials.
#[async_trait]
pub trait ConsoleBroker: Send + Sync {
    async fn create_session(&self, guest: &GuestRef) -> Result<ConsoleSession, RemoteError>;
}

/// Event from an established console connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Fatal transport error; the connection is gone.
    Fatal { reason: String },
    Disconnected { clean: bool, reason: Option<String> },
}

/// Remote console transport. `connect` resolves once negotiation succeeds;
/// the returned receiver yields events until the connection ends. The
/// engine treats the receiver closing without a `Disconnected` event as an
/// unexpected close.
#[async_trait]
pub trait ConsoleTransport: Send + Sync {
    async fn connect(
        &self,
        websocket_path: &str,
        password: &str,
    ) -> Result<mpsc::Receiver<TransportEvent>, RemoteError>;
}
