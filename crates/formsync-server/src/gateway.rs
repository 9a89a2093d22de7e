//! CollaborationGateway: connection-level coordination.
//!
//! Validated client events come in through [`EventHandler`]. The gateway
//! owns neither presence nor field values: membership lives in the
//! [`SessionRegistry`], values in the [`FieldStore`]. A field update is
//! persisted first and only then fanned out, so peers never observe a value
//! that was not committed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use formsync_protocol::{
    ClientEvent, FieldUpdate, FieldUpdateError, FormPresence, JoinForm, ServerEvent,
};
use formsync_store::{FieldKey, FieldStore, StoreError, StoredField};
use formsync_transport::{ConnectionHandle, ConnectionId, EventHandler};
use parking_lot::RwLock;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::{FieldUpdateChannel, FieldUpdateEvent};
use crate::registry::{JoinOutcome, LeaveOutcome, SessionRegistry};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Upper bound on one persistence upsert
    pub persist_timeout: Duration,
    /// Buffered updates per in-process observer
    pub observer_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            persist_timeout: Duration::from_secs(5),
            observer_capacity: 256,
        }
    }
}

/// Gateway lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Uninitialized,
    Running,
    Shutdown,
}

/// Why a field update was not broadcast. The `Display` text is what the
/// sender receives in `field-update-error`.
#[derive(Debug, thiserror::Error)]
pub enum RejectReason {
    #[error("connection is not registered")]
    NotConnected,

    #[error("collaboration gateway is not running")]
    NotRunning,

    #[error("not a member of form {0}")]
    NotMember(String),

    #[error("failed to save field value: {0}")]
    Persistence(#[from] StoreError),

    #[error("saving field value timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug)]
pub enum UpdateOutcome {
    /// Persisted and fanned out
    Broadcast { seq: u64, delivered: usize },
    Rejected(RejectReason),
}

impl UpdateOutcome {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::Broadcast { .. })
    }

    pub fn reject_reason(&self) -> Option<&RejectReason> {
        match self {
            Self::Rejected(reason) => Some(reason),
            Self::Broadcast { .. } => None,
        }
    }
}

/// Storage entity for an update: the response when one is named, otherwise
/// the form itself.
pub fn entity_id<'a>(form_id: &'a str, response_id: Option<&'a str>) -> &'a str {
    match response_id {
        Some(id) if !id.is_empty() => id,
        _ => form_id,
    }
}

pub struct CollaborationGateway<S: FieldStore> {
    registry: Arc<SessionRegistry>,
    channel: Arc<FieldUpdateChannel>,
    store: Arc<S>,
    connections: DashMap<ConnectionId, ConnectionHandle>,
    clock: AtomicU64,
    state: RwLock<GatewayState>,
    config: GatewayConfig,
}

impl<S: FieldStore> CollaborationGateway<S> {
    pub fn new(store: Arc<S>, config: GatewayConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let channel = Arc::new(FieldUpdateChannel::new(registry.clone(), config.observer_capacity));
        Self {
            registry,
            channel,
            store,
            connections: DashMap::new(),
            clock: AtomicU64::new(0),
            state: RwLock::new(GatewayState::Uninitialized),
            config,
        }
    }

    /// Prepare the store and start accepting events.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        self.store.init().await?;
        *self.state.write() = GatewayState::Running;
        info!("Collaboration gateway running (store: {})", self.store.backend());
        Ok(())
    }

    /// Stop accepting events. Updates already persisting finish on their own;
    /// later field updates are refused with `field-update-error`.
    pub fn shutdown(&self) {
        *self.state.write() = GatewayState::Shutdown;
        info!(
            "Collaboration gateway shut down ({} connection(s), {} form(s) open)",
            self.connections.len(),
            self.registry.form_count()
        );
    }

    pub fn state(&self) -> GatewayState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == GatewayState::Running
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn channel(&self) -> &Arc<FieldUpdateChannel> {
        &self.channel
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    // ─────────────────────────────────────────────────────────────────────
    // Connection lifecycle
    // ─────────────────────────────────────────────────────────────────────

    pub fn connect(&self, connection: ConnectionHandle) {
        debug!("Registered connection {}", connection.id());
        self.connections.insert(connection.shared_id(), connection);
    }

    pub fn is_connected(&self, connection: &str) -> bool {
        self.connections.contains_key(connection)
    }

    /// Forget the connection and leave every form it joined.
    pub fn disconnect(&self, connection: &str) -> Vec<(String, LeaveOutcome)> {
        self.connections.remove(connection);
        self.registry.leave_all(connection)
    }

    /// Join a form and send the joiner the current presence snapshot.
    /// `None` if the connection is not registered.
    pub fn join_form(&self, connection: &str, join: JoinForm) -> Option<JoinOutcome> {
        let Some(handle) = self.handle(connection) else {
            warn!("join-form from unregistered connection {connection}");
            return None;
        };

        let outcome = self.registry.join(&join.form_id, &handle, join.participant);
        handle.deliver(ServerEvent::FormPresence(FormPresence {
            form_id: join.form_id,
            participants: outcome.present.clone(),
        }));
        Some(outcome)
    }

    pub fn leave_form(&self, connection: &str, form_id: &str) -> LeaveOutcome {
        self.registry.leave(form_id, connection)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Field updates
    // ─────────────────────────────────────────────────────────────────────

    /// Order, persist and fan out one field update.
    ///
    /// Returns once the update holds its form's dispatch slot; persistence
    /// and broadcast continue on the returned task, independent of the
    /// originating connection.
    ///
    /// The slot is held until the store write has settled, even past
    /// `persist_timeout`. A write that commits after its timeout was reported
    /// is rolled back before the next update of the form proceeds.
    pub async fn submit_field_update(
        &self,
        connection: &str,
        update: FieldUpdate,
    ) -> JoinHandle<UpdateOutcome> {
        let Some(handle) = self.handle(connection) else {
            warn!("field-update from unregistered connection {connection}");
            return settled(UpdateOutcome::Rejected(RejectReason::NotConnected));
        };

        let Some(membership) = self.registry.membership(&update.form_id, connection) else {
            let reason = RejectReason::NotMember(update.form_id.clone());
            warn!("Rejected field-update from {connection}: {reason}");
            notify_error(&handle, &update.form_id, &update.field_id, &reason);
            return settled(UpdateOutcome::Rejected(reason));
        };

        let author = update
            .user_id
            .filter(|u| !u.is_empty())
            .or(membership.map(|p| p.user_id));
        let entity = entity_id(&update.form_id, update.response_id.as_deref()).to_string();

        let slot = self.channel.acquire(&update.form_id).await;
        let seq = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let event = FieldUpdateEvent {
            seq,
            form_id: update.form_id,
            entity_id: entity,
            response_id: update.response_id,
            field_id: update.field_id,
            value: update.value,
            author,
        };

        let store = self.store.clone();
        let channel = self.channel.clone();
        let persist_timeout = self.config.persist_timeout;

        tokio::spawn(async move {
            let key = FieldKey::new(event.entity_id.clone(), event.field_id.clone());
            let mut write = tokio::spawn(write_field(
                store.clone(),
                key.clone(),
                event.value.clone(),
                event.author.clone(),
            ));

            let outcome = match tokio::time::timeout(persist_timeout, &mut write).await {
                Ok(Ok(Ok(_))) => {
                    let delivered = channel.publish(&event, handle.id());
                    UpdateOutcome::Broadcast { seq, delivered }
                }
                Ok(Ok(Err(e))) => reject(&handle, &event, RejectReason::Persistence(e)),
                Ok(Err(e)) => reject(&handle, &event, RejectReason::Persistence(e.into())),
                Err(_) => {
                    let outcome = reject(&handle, &event, RejectReason::Timeout(persist_timeout));
                    settle_late_write(store.as_ref(), &key, write, seq).await;
                    outcome
                }
            };

            drop(slot);
            channel.release(&event.form_id);
            outcome
        })
    }

    /// Current stored value of a field, as a reloading client would see it.
    pub async fn current_value(
        &self,
        form_id: &str,
        response_id: Option<&str>,
        field_id: &str,
    ) -> Result<Option<StoredField>, StoreError> {
        let key = FieldKey::new(entity_id(form_id, response_id), field_id);
        self.store.field_value(&key).await
    }

    pub fn stats(&self) -> Value {
        json!({
            "state": format!("{:?}", self.state()),
            "store": self.store.backend(),
            "connections": self.connections.len(),
            "forms": self.registry.form_count(),
            "members": self.registry.connection_count(),
            "busyForms": self.channel.busy_forms(),
        })
    }

    fn handle(&self, connection: &str) -> Option<ConnectionHandle> {
        self.connections.get(connection).map(|h| h.clone())
    }

}

/// Store write for one update, with the row it replaces.
async fn write_field<S: FieldStore>(
    store: Arc<S>,
    key: FieldKey,
    value: String,
    author: Option<String>,
) -> Result<(Option<StoredField>, StoredField), StoreError> {
    let prior = store.field_value(&key).await?;
    let stored = store.upsert_field_value(&key, &value, author.as_deref()).await?;
    Ok((prior, stored))
}

/// Wait out a write whose timeout was already reported, and undo it if it
/// committed anyway.
async fn settle_late_write<S: FieldStore>(
    store: &S,
    key: &FieldKey,
    write: JoinHandle<Result<(Option<StoredField>, StoredField), StoreError>>,
    seq: u64,
) {
    let Ok(Ok((prior, _))) = write.await else {
        return;
    };
    match store.restore_field_value(key, prior.as_ref()).await {
        Ok(()) => warn!(
            "field-update #{seq} {}/{} committed after its timeout, rolled back",
            key.entity_id, key.field_id
        ),
        Err(e) => error!(
            "field-update #{seq} {}/{} committed after its timeout and could not be rolled back: {e}",
            key.entity_id, key.field_id
        ),
    }
}

fn settled(outcome: UpdateOutcome) -> JoinHandle<UpdateOutcome> {
    tokio::spawn(async move { outcome })
}

fn notify_error(handle: &ConnectionHandle, form_id: &str, field_id: &str, reason: &RejectReason) {
    handle.deliver(ServerEvent::FieldUpdateError(FieldUpdateError {
        form_id: form_id.to_string(),
        field_id: field_id.to_string(),
        error: reason.to_string(),
    }));
}

fn reject(handle: &ConnectionHandle, event: &FieldUpdateEvent, reason: RejectReason) -> UpdateOutcome {
    warn!(
        "field-update #{} {}/{} from {} not saved: {reason}",
        event.seq,
        event.form_id,
        event.field_id,
        handle.id()
    );
    notify_error(handle, &event.form_id, &event.field_id, &reason);
    UpdateOutcome::Rejected(reason)
}

// ─────────────────────────────────────────────────────────────────────────────
// EventHandler implementation
// ─────────────────────────────────────────────────────────────────────────────

impl<S: FieldStore> EventHandler for CollaborationGateway<S> {
    fn on_connect(&self, connection: ConnectionHandle) {
        self.connect(connection);
    }

    async fn on_event(&self, connection: &ConnectionHandle, event: ClientEvent) {
        if !self.is_running() {
            warn!("Gateway not running, refusing {} from {}", event.name(), connection.id());
            if let ClientEvent::FieldUpdate(update) = &event {
                notify_error(connection, &update.form_id, &update.field_id, &RejectReason::NotRunning);
            }
            return;
        }

        match event {
            ClientEvent::JoinForm(join) => {
                self.join_form(connection.id(), join);
            }
            ClientEvent::LeaveForm(leave) => {
                self.leave_form(connection.id(), &leave.form_id);
            }
            ClientEvent::FieldUpdate(update) => {
                // Detached: the outcome is reported to the sender by the task.
                drop(self.submit_field_update(connection.id(), update).await);
            }
        }
    }

    fn on_disconnect(&self, connection_id: &str) {
        self.disconnect(connection_id);
    }

    fn stats(&self) -> Value {
        json!({ "gateway": CollaborationGateway::stats(self) })
    }
}
