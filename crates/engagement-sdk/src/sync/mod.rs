//! PDT sync: pairs a viewer with an operator console over a dedicated pub/sub
//! channel and streams the viewer's playhead to it once per interval.

pub mod coordinator;
pub mod messages;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use pubsub_bus::BusError;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use coordinator::SyncCoordinator;
pub use messages::{SyncMessage, SyncSessionStatus, SyncSessionUpdate};
pub use session::{ReqwestSessionSetup, SessionSetup, SyncSession};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("sync session setup failed: {0}")]
    SessionSetup(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected http status {0}")]
    HttpStatus(u16),
    #[error("invalid sync session response: {0}")]
    InvalidResponse(String),
    #[error("sync channel missing or invalid")]
    InvalidChannel,
    #[error("ping carried no usable publish key")]
    InvalidPublishKey,
    #[error("pub/sub transport error: {0}")]
    Transport(String),
    #[error("sync session already started")]
    AlreadyStarted,
    #[error("sync coordinator torn down")]
    TornDown,
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => SyncError::HttpStatus(status.as_u16()),
            None => SyncError::Network(err.to_string()),
        }
    }
}

impl From<BusError> for SyncError {
    fn from(err: BusError) -> Self {
        SyncError::Transport(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    /// Session setup in flight, or subscribed and waiting for the operator's ping.
    Connecting,
    /// Publish key installed and pong sent; waiting for `connected`.
    Handshaking { publish_key: String },
    /// Timer running.
    Connected,
    TornDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotification {
    PinReceived { pin: String, connect_timeout: Duration },
    Connected,
    Failed(SyncError),
}

/// Host-side observer of a sync session.
pub trait SyncDelegate: Send + Sync {
    fn pin_received(&self, pin: &str, connect_timeout: Duration);

    fn connected(&self);

    fn failed(&self, error: &SyncError);
}

/// Drives `delegate` from the coordinator's notification channel on a single
/// task, so callbacks never interleave. Ends when the coordinator is dropped.
pub fn spawn_delegate_dispatch(
    mut notifications: mpsc::UnboundedReceiver<SyncNotification>,
    delegate: Arc<dyn SyncDelegate>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            match notification {
                SyncNotification::PinReceived { pin, connect_timeout } => {
                    delegate.pin_received(&pin, connect_timeout)
                }
                SyncNotification::Connected => delegate.connected(),
                SyncNotification::Failed(error) => delegate.failed(&error),
            }
        }
    })
}
