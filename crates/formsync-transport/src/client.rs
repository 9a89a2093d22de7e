//! Per-connection state and the handle other subsystems use to reach a client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use formsync_protocol::{AuthState, ServerEvent};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

pub type ConnectionId = Arc<str>;

/// Cheap, cloneable address of one live connection.
///
/// Delivery is best-effort: events go into a bounded outbox drained by the
/// connection's socket task. A full or closed outbox drops the event.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbox: mpsc::Sender<ServerEvent>,
}

impl ConnectionHandle {
    /// Create a handle together with the receiving end of its outbox.
    pub fn channel(id: impl Into<ConnectionId>, capacity: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (outbox, rx) = mpsc::channel(capacity.max(1));
        (Self { id: id.into(), outbox }, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn shared_id(&self) -> ConnectionId {
        self.id.clone()
    }

    /// Queue an event for this connection. Returns whether it was queued.
    pub fn deliver(&self, event: ServerEvent) -> bool {
        match self.outbox.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!("Outbox full for {}, dropping {}", self.id, event.name());
                false
            }
            Err(TrySendError::Closed(event)) => {
                debug!("Connection {} gone, dropping {}", self.id, event.name());
                false
            }
        }
    }
}

/// Socket-task-local view of a client: auth progress and liveness.
#[derive(Debug)]
pub struct ClientConnection {
    pub id: ConnectionId,
    pub connected_at: Instant,
    pub auth_state: AuthState,
    /// Client label from the handshake, if one was sent
    pub client_name: Option<String>,
    /// Last time we received any frame from this client
    pub last_activity: Instant,
}

impl ClientConnection {
    pub fn new(id: impl Into<ConnectionId>, requires_auth: bool) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            connected_at: now,
            auth_state: if requires_auth {
                AuthState::Pending
            } else {
                AuthState::Authenticated
            },
            client_name: None,
            last_activity: now,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_state == AuthState::Authenticated
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// No frame (including pongs) for longer than `window`.
    pub fn is_stale(&self, window: Duration) -> bool {
        self.last_activity.elapsed() > window
    }
}
