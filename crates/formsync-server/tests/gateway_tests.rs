//! Gateway scenarios: persist-then-broadcast, sender exclusion, failure
//! isolation, ordering and disconnect cleanup.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use formsync_protocol::{ClientEvent, FieldUpdate, JoinForm, Participant, ServerEvent};
use formsync_server::{CollaborationGateway, GatewayConfig, GatewayState, RejectReason};
use formsync_store::{FieldKey, FieldStore, MemoryFieldStore, StoreError, StoredField};
use formsync_transport::{ConnectionHandle, EventHandler};
use parking_lot::Mutex;
use tokio::sync::mpsc;

// ─────────────────────────────────────────────────────────────────────────────
// Test stores
// ─────────────────────────────────────────────────────────────────────────────

/// Memory store whose writes can be switched to fail.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryFieldStore,
    failing: AtomicBool,
}

impl FieldStore for FlakyStore {
    fn backend(&self) -> &'static str {
        "flaky"
    }

    async fn upsert_field_value(
        &self,
        key: &FieldKey,
        value: &str,
        writer: Option<&str>,
    ) -> Result<StoredField, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("disk on fire".into()));
        }
        self.inner.upsert_field_value(key, value, writer).await
    }

    async fn restore_field_value(&self, key: &FieldKey, prior: Option<&StoredField>) -> Result<(), StoreError> {
        self.inner.restore_field_value(key, prior).await
    }

    async fn field_value(&self, key: &FieldKey) -> Result<Option<StoredField>, StoreError> {
        self.inner.field_value(key).await
    }
}

/// Memory store that sleeps before writing particular values.
#[derive(Default)]
struct SlowStore {
    inner: MemoryFieldStore,
    delays: HashMap<String, Duration>,
}

impl FieldStore for SlowStore {
    fn backend(&self) -> &'static str {
        "slow"
    }

    async fn upsert_field_value(
        &self,
        key: &FieldKey,
        value: &str,
        writer: Option<&str>,
    ) -> Result<StoredField, StoreError> {
        if let Some(delay) = self.delays.get(value) {
            tokio::time::sleep(*delay).await;
        }
        self.inner.upsert_field_value(key, value, writer).await
    }

    async fn restore_field_value(&self, key: &FieldKey, prior: Option<&StoredField>) -> Result<(), StoreError> {
        self.inner.restore_field_value(key, prior).await
    }

    async fn field_value(&self, key: &FieldKey) -> Result<Option<StoredField>, StoreError> {
        self.inner.field_value(key).await
    }
}

/// Store whose writes run on a blocking thread, the way `SqliteFieldStore`
/// does. Dropping the caller's future does not stop a write in flight.
#[derive(Default)]
struct DetachedStore {
    values: Arc<Mutex<HashMap<FieldKey, StoredField>>>,
    delays: HashMap<String, Duration>,
}

impl FieldStore for DetachedStore {
    fn backend(&self) -> &'static str {
        "detached"
    }

    async fn upsert_field_value(
        &self,
        key: &FieldKey,
        value: &str,
        writer: Option<&str>,
    ) -> Result<StoredField, StoreError> {
        let stored = StoredField {
            value: value.to_string(),
            updated_by: writer.map(str::to_string),
            updated_at: Utc::now(),
        };
        let delay = self.delays.get(value).copied();
        let values = self.values.clone();
        let key = key.clone();
        let row = stored.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
            values.lock().insert(key, row);
        })
        .await?;
        Ok(stored)
    }

    async fn restore_field_value(&self, key: &FieldKey, prior: Option<&StoredField>) -> Result<(), StoreError> {
        let mut values = self.values.lock();
        match prior {
            Some(row) => values.insert(key.clone(), row.clone()),
            None => values.remove(key),
        };
        Ok(())
    }

    async fn field_value(&self, key: &FieldKey) -> Result<Option<StoredField>, StoreError> {
        Ok(self.values.lock().get(key).cloned())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

struct Peer {
    handle: ConnectionHandle,
    rx: mpsc::Receiver<ServerEvent>,
}

impl Peer {
    fn id(&self) -> &str {
        self.handle.id()
    }

    fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn field_updates(&mut self) -> Vec<(String, String, u64)> {
        self.drain()
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::FieldUpdated(u) => Some((u.field_id, u.value, u.seq)),
                _ => None,
            })
            .collect()
    }
}

async fn gateway<S: FieldStore>(store: S, config: GatewayConfig) -> Arc<CollaborationGateway<S>> {
    let gateway = Arc::new(CollaborationGateway::new(Arc::new(store), config));
    gateway.initialize().await.unwrap();
    gateway
}

fn connect<S: FieldStore>(gateway: &CollaborationGateway<S>, id: &str) -> Peer {
    let (handle, rx) = ConnectionHandle::channel(id, 64);
    gateway.connect(handle.clone());
    Peer { handle, rx }
}

fn join<S: FieldStore>(gateway: &CollaborationGateway<S>, peer: &mut Peer, form: &str, user: Option<&str>) {
    gateway
        .join_form(
            peer.id(),
            JoinForm {
                form_id: form.into(),
                participant: user.map(|u| Participant::new(u, Some(format!("{u}@example.com")))),
            },
        )
        .unwrap();
    peer.drain();
}

fn update(form: &str, field: &str, value: &str) -> FieldUpdate {
    FieldUpdate {
        form_id: form.into(),
        response_id: None,
        field_id: field.into(),
        value: value.into(),
        user_id: None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn update_reaches_peer_not_sender_and_is_persisted() {
    let gw = gateway(MemoryFieldStore::new(), GatewayConfig::default()).await;
    let mut c1 = connect(&gw, "c1");
    let mut c2 = connect(&gw, "c2");
    join(&gw, &mut c1, "f1", None);
    join(&gw, &mut c2, "f1", None);

    let outcome = gw
        .submit_field_update("c1", update("f1", "name", "Alice"))
        .await
        .await
        .unwrap();
    assert!(outcome.is_broadcast());

    let received = c2.field_updates();
    assert_eq!(received.len(), 1);
    assert_eq!((received[0].0.as_str(), received[0].1.as_str()), ("name", "Alice"));
    assert!(c1.drain().is_empty());

    let stored = gw.current_value("f1", None, "name").await.unwrap().unwrap();
    assert_eq!(stored.value, "Alice");
}

#[tokio::test]
async fn disconnect_announces_departure_once_per_form() {
    let gw = gateway(MemoryFieldStore::new(), GatewayConfig::default()).await;
    let mut c1 = connect(&gw, "c1");
    let mut c2 = connect(&gw, "c2");
    let mut c3 = connect(&gw, "c3");
    join(&gw, &mut c2, "f1", Some("bob"));
    join(&gw, &mut c3, "f2", Some("carol"));
    join(&gw, &mut c1, "f1", Some("alice"));
    join(&gw, &mut c1, "f2", Some("alice"));
    c2.drain();
    c3.drain();

    let left = gw.disconnect("c1");
    assert_eq!(left.len(), 2);

    for peer in [&mut c2, &mut c3] {
        let departures: Vec<_> = peer
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::UserLeft(l) => Some(l.user_id),
                _ => None,
            })
            .collect();
        assert_eq!(departures, vec!["alice".to_string()]);
    }
    assert!(!gw.registry().is_member("f1", "c1"));
    assert!(!gw.is_connected("c1"));
}

#[tokio::test]
async fn failed_write_notifies_sender_only_and_keeps_old_value() {
    let gw = gateway(FlakyStore::default(), GatewayConfig::default()).await;
    let mut c1 = connect(&gw, "c1");
    let mut c2 = connect(&gw, "c2");
    join(&gw, &mut c1, "f1", None);
    join(&gw, &mut c2, "f1", None);

    gw.submit_field_update("c1", update("f1", "name", "Old"))
        .await
        .await
        .unwrap();
    c2.drain();

    gw.store().failing.store(true, Ordering::SeqCst);
    let outcome = gw
        .submit_field_update("c1", update("f1", "name", "New"))
        .await
        .await
        .unwrap();

    assert!(matches!(outcome.reject_reason(), Some(RejectReason::Persistence(_))));
    match c1.drain().as_slice() {
        [ServerEvent::FieldUpdateError(err)] => {
            assert_eq!(err.field_id, "name");
            assert!(err.error.contains("disk on fire"));
        }
        other => panic!("expected one field-update-error, got {other:?}"),
    }
    assert!(c2.drain().is_empty());

    let stored = gw.current_value("f1", None, "name").await.unwrap().unwrap();
    assert_eq!(stored.value, "Old");
}

#[tokio::test]
async fn slow_write_times_out_without_broadcast() {
    let store = SlowStore {
        delays: HashMap::from([("late".to_string(), Duration::from_millis(500))]),
        ..Default::default()
    };
    let config = GatewayConfig {
        persist_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let gw = gateway(store, config).await;
    let mut c1 = connect(&gw, "c1");
    let mut c2 = connect(&gw, "c2");
    join(&gw, &mut c1, "f1", None);
    join(&gw, &mut c2, "f1", None);

    gw.submit_field_update("c1", update("f1", "bio", "early"))
        .await
        .await
        .unwrap();
    c2.drain();

    let outcome = gw
        .submit_field_update("c1", update("f1", "bio", "late"))
        .await
        .await
        .unwrap();

    assert!(matches!(outcome.reject_reason(), Some(RejectReason::Timeout(_))));
    assert!(matches!(c1.drain().as_slice(), [ServerEvent::FieldUpdateError(_)]));
    assert!(c2.drain().is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stored = gw.current_value("f1", None, "bio").await.unwrap().unwrap();
    assert_eq!(stored.value, "early");
}

#[tokio::test]
async fn timed_out_write_that_commits_late_is_rolled_back() {
    let store = DetachedStore {
        delays: HashMap::from([
            ("A".to_string(), Duration::from_millis(200)),
            ("late".to_string(), Duration::from_millis(200)),
        ]),
        ..Default::default()
    };
    let config = GatewayConfig {
        persist_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let gw = gateway(store, config).await;
    let mut c1 = connect(&gw, "c1");
    let mut c2 = connect(&gw, "c2");
    join(&gw, &mut c1, "f1", None);
    join(&gw, &mut c2, "f1", None);

    // A times out while its write keeps running; B is submitted behind it.
    let first = gw.submit_field_update("c1", update("f1", "title", "A")).await;
    let gw2 = gw.clone();
    let second = tokio::spawn(async move {
        gw2.submit_field_update("c1", update("f1", "title", "B"))
            .await
            .await
            .unwrap()
    });

    assert!(matches!(first.await.unwrap().reject_reason(), Some(RejectReason::Timeout(_))));
    assert!(second.await.unwrap().is_broadcast());

    let errors: Vec<_> = c1
        .drain()
        .into_iter()
        .filter(|e| matches!(e, ServerEvent::FieldUpdateError(_)))
        .collect();
    assert_eq!(errors.len(), 1);
    let seen: Vec<String> = c2.field_updates().into_iter().map(|(_, v, _)| v).collect();
    assert_eq!(seen, vec!["B"]);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let stored = gw.current_value("f1", None, "title").await.unwrap().unwrap();
    assert_eq!(stored.value, "B");

    // With nothing stored before, a late commit leaves no value behind.
    let outcome = gw
        .submit_field_update("c1", update("f1", "notes", "late"))
        .await
        .await
        .unwrap();
    assert!(matches!(outcome.reject_reason(), Some(RejectReason::Timeout(_))));
    assert!(gw.current_value("f1", None, "notes").await.unwrap().is_none());
    assert!(c2.drain().is_empty());
}

#[tokio::test]
async fn non_member_update_is_rejected_and_not_stored() {
    let gw = gateway(MemoryFieldStore::new(), GatewayConfig::default()).await;
    let mut c1 = connect(&gw, "c1");
    let mut c2 = connect(&gw, "c2");
    join(&gw, &mut c2, "f1", None);

    let outcome = gw
        .submit_field_update("c1", update("f1", "name", "sneaky"))
        .await
        .await
        .unwrap();

    assert!(matches!(outcome.reject_reason(), Some(RejectReason::NotMember(f)) if f == "f1"));
    assert!(matches!(c1.drain().as_slice(), [ServerEvent::FieldUpdateError(_)]));
    assert!(c2.drain().is_empty());
    assert!(gw.current_value("f1", None, "name").await.unwrap().is_none());

    // After leaving, updates are rejected again.
    join(&gw, &mut c1, "f1", None);
    gw.leave_form("c1", "f1");
    let outcome = gw
        .submit_field_update("c1", update("f1", "name", "again"))
        .await
        .await
        .unwrap();
    assert!(!outcome.is_broadcast());
}

#[tokio::test]
async fn unregistered_connection_is_rejected() {
    let gw = gateway(MemoryFieldStore::new(), GatewayConfig::default()).await;
    let outcome = gw
        .submit_field_update("ghost", update("f1", "name", "boo"))
        .await
        .await
        .unwrap();
    assert!(matches!(outcome.reject_reason(), Some(RejectReason::NotConnected)));
}

#[tokio::test]
async fn later_update_wins_despite_slower_first_write() {
    let store = SlowStore {
        delays: HashMap::from([("A".to_string(), Duration::from_millis(100))]),
        ..Default::default()
    };
    let gw = gateway(store, GatewayConfig::default()).await;
    let mut c1 = connect(&gw, "c1");
    let mut c2 = connect(&gw, "c2");
    let mut c3 = connect(&gw, "c3");
    join(&gw, &mut c1, "f1", None);
    join(&gw, &mut c2, "f1", None);
    join(&gw, &mut c3, "f1", None);

    let first = gw.submit_field_update("c1", update("f1", "title", "A")).await;
    let gw2 = gw.clone();
    let second = tokio::spawn(async move {
        gw2.submit_field_update("c2", update("f1", "title", "B"))
            .await
            .await
            .unwrap()
    });

    assert!(first.await.unwrap().is_broadcast());
    assert!(second.await.unwrap().is_broadcast());

    let stored = gw.current_value("f1", None, "title").await.unwrap().unwrap();
    assert_eq!(stored.value, "B");

    let seen = c3.field_updates();
    let values: Vec<&str> = seen.iter().map(|(_, v, _)| v.as_str()).collect();
    assert_eq!(values, vec!["A", "B"]);
    assert!(seen[0].2 < seen[1].2);
}

#[tokio::test]
async fn empty_value_overwrites() {
    let gw = gateway(MemoryFieldStore::new(), GatewayConfig::default()).await;
    let mut c1 = connect(&gw, "c1");
    join(&gw, &mut c1, "f1", None);

    for value in ["filled", ""] {
        gw.submit_field_update("c1", update("f1", "notes", value))
            .await
            .await
            .unwrap();
    }
    let stored = gw.current_value("f1", None, "notes").await.unwrap().unwrap();
    assert_eq!(stored.value, "");
}

#[tokio::test]
async fn author_defaults_to_joined_identity() {
    let gw = gateway(MemoryFieldStore::new(), GatewayConfig::default()).await;
    let mut c1 = connect(&gw, "c1");
    let mut c2 = connect(&gw, "c2");
    join(&gw, &mut c1, "f1", Some("alice"));
    join(&gw, &mut c2, "f1", None);

    gw.submit_field_update("c1", update("f1", "name", "Alice"))
        .await
        .await
        .unwrap();

    match c2.drain().as_slice() {
        [ServerEvent::FieldUpdated(u)] => assert_eq!(u.user_id.as_deref(), Some("alice")),
        other => panic!("expected one field-updated, got {other:?}"),
    }
    let stored = gw.current_value("f1", None, "name").await.unwrap().unwrap();
    assert_eq!(stored.updated_by.as_deref(), Some("alice"));
    assert!(stored.updated_at <= Utc::now());
}

#[tokio::test]
async fn response_values_are_isolated_from_form_values() {
    let gw = gateway(MemoryFieldStore::new(), GatewayConfig::default()).await;
    let mut c1 = connect(&gw, "c1");
    join(&gw, &mut c1, "f1", None);

    let mut per_response = update("f1", "email", "a@x");
    per_response.response_id = Some("r1".into());
    gw.submit_field_update("c1", per_response).await.await.unwrap();

    let r1 = gw.current_value("f1", Some("r1"), "email").await.unwrap();
    assert_eq!(r1.map(|s| s.value).as_deref(), Some("a@x"));
    assert!(gw.current_value("f1", None, "email").await.unwrap().is_none());
    assert!(gw.current_value("f1", Some("r2"), "email").await.unwrap().is_none());
}

#[tokio::test]
async fn joiner_receives_presence_snapshot() {
    let gw = gateway(MemoryFieldStore::new(), GatewayConfig::default()).await;
    let mut c1 = connect(&gw, "c1");
    let mut c2 = connect(&gw, "c2");
    join(&gw, &mut c1, "f1", Some("alice"));

    gw.join_form(
        "c2",
        JoinForm {
            form_id: "f1".into(),
            participant: Some(Participant::new("bob", None)),
        },
    );

    match c2.drain().as_slice() {
        [ServerEvent::FormPresence(p)] => {
            assert_eq!(p.form_id, "f1");
            let users: Vec<&str> = p.participants.iter().map(|p| p.user_id.as_str()).collect();
            assert_eq!(users, vec!["alice"]);
        }
        other => panic!("expected one form-presence, got {other:?}"),
    }
    assert!(matches!(c1.drain().as_slice(), [ServerEvent::UserJoined(j)] if j.user_id == "bob"));
}

#[tokio::test]
async fn subscription_sees_committed_updates_until_dropped() {
    let gw = gateway(FlakyStore::default(), GatewayConfig::default()).await;
    let mut c1 = connect(&gw, "c1");
    join(&gw, &mut c1, "f1", None);

    let mut sub = gw.channel().subscribe("f1");
    assert_eq!(gw.channel().observed_forms(), 1);

    gw.submit_field_update("c1", update("f1", "name", "ok"))
        .await
        .await
        .unwrap();
    gw.store().failing.store(true, Ordering::SeqCst);
    gw.submit_field_update("c1", update("f1", "name", "lost"))
        .await
        .await
        .unwrap();

    let event = sub.recv().await.unwrap();
    assert_eq!(event.value, "ok");
    assert_eq!(event.entity_id, "f1");
    assert!(sub.try_recv().is_none());

    drop(sub);
    assert_eq!(gw.channel().observed_forms(), 0);
}

#[tokio::test]
async fn events_are_dropped_unless_running() {
    let gw = Arc::new(CollaborationGateway::new(
        Arc::new(MemoryFieldStore::new()),
        GatewayConfig::default(),
    ));
    assert_eq!(gw.state(), GatewayState::Uninitialized);

    let (handle, _rx) = ConnectionHandle::channel("c1", 8);
    gw.on_connect(handle.clone());
    let join_f1 = ClientEvent::JoinForm(JoinForm {
        form_id: "f1".into(),
        participant: None,
    });

    gw.on_event(&handle, join_f1.clone()).await;
    assert!(!gw.registry().is_member("f1", "c1"));

    gw.initialize().await.unwrap();
    gw.on_event(&handle, join_f1.clone()).await;
    assert!(gw.registry().is_member("f1", "c1"));

    gw.shutdown();
    gw.on_event(&handle, ClientEvent::LeaveForm(formsync_protocol::LeaveForm {
        form_id: "f1".into(),
    }))
    .await;
    assert!(gw.registry().is_member("f1", "c1"));

    gw.on_disconnect("c1");
    assert_eq!(gw.registry().form_count(), 0);
}

#[tokio::test]
async fn update_after_shutdown_is_refused_to_sender() {
    let gw = gateway(MemoryFieldStore::new(), GatewayConfig::default()).await;
    let (handle, mut rx) = ConnectionHandle::channel("c1", 8);
    let mut c2 = connect(&gw, "c2");
    gw.on_connect(handle.clone());
    join(&gw, &mut c2, "f1", None);
    gw.on_event(
        &handle,
        ClientEvent::JoinForm(JoinForm {
            form_id: "f1".into(),
            participant: None,
        }),
    )
    .await;
    while rx.try_recv().is_ok() {}

    gw.shutdown();
    gw.on_event(&handle, ClientEvent::FieldUpdate(update("f1", "name", "late"))).await;

    match rx.try_recv() {
        Ok(ServerEvent::FieldUpdateError(err)) => {
            assert_eq!(err.form_id, "f1");
            assert_eq!(err.field_id, "name");
            assert!(err.error.contains("not running"));
        }
        other => panic!("expected field-update-error, got {other:?}"),
    }
    assert!(c2.drain().is_empty());
    assert!(gw.current_value("f1", None, "name").await.unwrap().is_none());
}

#[tokio::test]
async fn health_stats_report_sessions() {
    let gw = gateway(MemoryFieldStore::new(), GatewayConfig::default()).await;
    let mut c1 = connect(&gw, "c1");
    join(&gw, &mut c1, "f1", None);

    let stats = EventHandler::stats(&*gw);
    assert_eq!(stats["gateway"]["forms"], 1);
    assert_eq!(stats["gateway"]["connections"], 1);
    assert_eq!(stats["gateway"]["store"], "memory");
    assert_eq!(stats["gateway"]["state"], "Running");
}
