//! Field update fan-out.
//!
//! Committed updates go to every member of the form except the originator,
//! plus any in-process observers holding a [`Subscription`]. Delivery is
//! best-effort: a peer whose outbox is full or closed misses the event and
//! picks up the persisted value on its next reload.

use std::sync::Arc;

use dashmap::DashMap;
use formsync_protocol::{FieldUpdated, ServerEvent};
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast};
use tracing::{debug, warn};

use crate::registry::SessionRegistry;

/// A field update that passed validation and was ordered at the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldUpdateEvent {
    /// Logical timestamp: arrival order at the gateway
    pub seq: u64,
    pub form_id: String,
    /// Storage entity the value belongs to (response id, or form id)
    pub entity_id: String,
    pub response_id: Option<String>,
    pub field_id: String,
    pub value: String,
    pub author: Option<String>,
}

impl FieldUpdateEvent {
    pub fn to_server_event(&self) -> ServerEvent {
        ServerEvent::FieldUpdated(FieldUpdated {
            form_id: self.form_id.clone(),
            response_id: self.response_id.clone(),
            field_id: self.field_id.clone(),
            value: self.value.clone(),
            user_id: self.author.clone(),
            seq: self.seq,
        })
    }
}

type Observers = DashMap<String, broadcast::Sender<FieldUpdateEvent>>;

/// Per-form broadcast group on top of the [`SessionRegistry`].
pub struct FieldUpdateChannel {
    registry: Arc<SessionRegistry>,
    /// One FIFO lock per form with updates in flight
    dispatch: DashMap<String, Arc<Mutex<()>>>,
    observers: Arc<Observers>,
    observer_capacity: usize,
}

/// Exclusive right to persist and publish the next update of one form.
pub type DispatchSlot = OwnedMutexGuard<()>;

impl FieldUpdateChannel {
    pub fn new(registry: Arc<SessionRegistry>, observer_capacity: usize) -> Self {
        Self {
            registry,
            dispatch: DashMap::new(),
            observers: Arc::new(DashMap::new()),
            observer_capacity: observer_capacity.max(1),
        }
    }

    /// Wait for this form's dispatch slot. Waiters are served in the order
    /// they called `acquire`.
    pub async fn acquire(&self, form_id: &str) -> DispatchSlot {
        let lock = self
            .dispatch
            .entry(form_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Drop the form's dispatch lock once nobody holds or waits on it.
    pub fn release(&self, form_id: &str) {
        self.dispatch
            .remove_if(form_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Deliver a committed update to every member but `origin`, and to
    /// observers. Returns how many connections accepted it.
    pub fn publish(&self, event: &FieldUpdateEvent, origin: &str) -> usize {
        let delivered = self
            .registry
            .broadcast(&event.form_id, Some(origin), &event.to_server_event());

        let unobserved = match self.observers.get(&event.form_id) {
            Some(tx) => tx.send(event.clone()).is_err(),
            None => false,
        };
        if unobserved {
            self.observers
                .remove_if(&event.form_id, |_, tx| tx.receiver_count() == 0);
        }

        debug!(
            "field-updated #{} {}/{} → {} peer(s)",
            event.seq, event.form_id, event.field_id, delivered
        );
        delivered
    }

    /// Observe committed updates for `form_id` until the handle is dropped.
    pub fn subscribe(&self, form_id: &str) -> Subscription {
        let rx = self
            .observers
            .entry(form_id.to_string())
            .or_insert_with(|| broadcast::channel(self.observer_capacity).0)
            .subscribe();
        Subscription {
            form_id: form_id.to_string(),
            rx: Some(rx),
            observers: self.observers.clone(),
        }
    }

    /// Forms with at least one live subscription.
    pub fn observed_forms(&self) -> usize {
        self.observers.len()
    }

    /// Forms with an update in flight.
    pub fn busy_forms(&self) -> usize {
        self.dispatch.len()
    }
}

/// Handle returned by [`FieldUpdateChannel::subscribe`]. Dropping it
/// unsubscribes.
pub struct Subscription {
    form_id: String,
    rx: Option<broadcast::Receiver<FieldUpdateEvent>>,
    observers: Arc<Observers>,
}

impl Subscription {
    pub fn form_id(&self) -> &str {
        &self.form_id
    }

    /// Next committed update. `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<FieldUpdateEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Observer of {} lagged, skipped {skipped} update(s)", self.form_id);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<FieldUpdateEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.rx.take();
        self.observers
            .remove_if(&self.form_id, |_, tx| tx.receiver_count() == 0);
    }
}
