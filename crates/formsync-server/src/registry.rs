//! SessionRegistry: live presence per form.
//!
//! Pure in-memory bookkeeping. Every operation takes one short
//! `parking_lot::Mutex` section; presence notifications are queued on the
//! peers' outboxes (non-blocking) inside that section so that arrival and
//! departure events reach each peer in the order the registry applied them.

use std::collections::{HashMap, HashSet};

use formsync_protocol::{Participant, ServerEvent, UserJoined, UserLeft};
use formsync_transport::{ConnectionHandle, ConnectionId};
use parking_lot::Mutex;
use tracing::{debug, info};

struct Member {
    handle: ConnectionHandle,
    participant: Option<Participant>,
}

#[derive(Default)]
struct FormSession {
    members: HashMap<ConnectionId, Member>,
}

impl FormSession {
    /// Is `user_id` carried by any member other than `except`?
    fn has_user(&self, user_id: &str, except: &str) -> bool {
        self.members.iter().any(|(id, m)| {
            &**id != except && m.participant.as_ref().is_some_and(|p| p.user_id == user_id)
        })
    }

    /// Identified participants, one entry per user id, sorted by user id.
    fn participants(&self, except: Option<&str>) -> Vec<Participant> {
        let mut seen = HashSet::new();
        let mut out: Vec<Participant> = self
            .members
            .iter()
            .filter(|(id, _)| Some(&***id) != except)
            .filter_map(|(_, m)| m.participant.clone())
            .filter(|p| seen.insert(p.user_id.clone()))
            .collect();
        out.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        out
    }

    fn broadcast(&self, except: Option<&str>, event: &ServerEvent) -> usize {
        self.members
            .iter()
            .filter(|(id, _)| Some(&***id) != except)
            .filter(|(_, m)| m.handle.deliver(event.clone()))
            .count()
    }
}

#[derive(Default)]
struct Inner {
    forms: HashMap<String, FormSession>,
    /// Reverse index: connection → forms it is a member of
    joined: HashMap<ConnectionId, HashSet<String>>,
}

/// Result of [`SessionRegistry::join`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinOutcome {
    /// The connection was not a member before this call
    pub newly_joined: bool,
    /// A `user-joined` was sent to the rest of the form
    pub announced: bool,
    /// Peers the announcement was queued for
    pub notified: usize,
    /// Identified participants already present, excluding the joiner
    pub present: Vec<Participant>,
}

/// Result of [`SessionRegistry::leave`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub was_member: bool,
    /// A `user-left` was sent to the remaining members
    pub announced: bool,
    pub notified: usize,
    /// The form had no members left and was dropped
    pub form_closed: bool,
}

/// Maps form ids to the connections currently in them.
///
/// Forms are created by the first join and dropped with their last member.
/// Presence is tracked per user id: only the first connection of a user
/// announces an arrival and only the last one announces a departure.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `connection` to `form_id`.
    ///
    /// Idempotent: a repeated join does not duplicate membership. A repeated
    /// join may attach an identity to a member that joined anonymously; an
    /// identity already attached is kept.
    pub fn join(
        &self,
        form_id: &str,
        connection: &ConnectionHandle,
        participant: Option<Participant>,
    ) -> JoinOutcome {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let conn = connection.shared_id();

        let session = inner.forms.entry(form_id.to_string()).or_default();
        let (newly_joined, attached) = match session.members.get_mut(&*conn) {
            Some(member) => {
                let attached = if member.participant.is_none() && participant.is_some() {
                    member.participant = participant.clone();
                    participant
                } else {
                    None
                };
                (false, attached)
            }
            None => {
                session.members.insert(
                    conn.clone(),
                    Member {
                        handle: connection.clone(),
                        participant: participant.clone(),
                    },
                );
                (true, participant)
            }
        };

        let mut outcome = JoinOutcome {
            newly_joined,
            ..Default::default()
        };

        if let Some(p) = attached {
            if !session.has_user(&p.user_id, &conn) {
                let event = ServerEvent::UserJoined(UserJoined {
                    form_id: form_id.to_string(),
                    user_id: p.user_id.clone(),
                    email: p.email.clone(),
                });
                outcome.announced = true;
                outcome.notified = session.broadcast(Some(&*conn), &event);
            }
        }

        let own_user = session
            .members
            .get(&*conn)
            .and_then(|m| m.participant.as_ref())
            .map(|p| p.user_id.clone());
        outcome.present = session
            .participants(Some(&*conn))
            .into_iter()
            .filter(|p| Some(&p.user_id) != own_user.as_ref())
            .collect();

        inner.joined.entry(conn.clone()).or_default().insert(form_id.to_string());

        if newly_joined {
            info!(
                "{} joined form {} ({} members)",
                conn,
                form_id,
                session.members.len()
            );
        }
        outcome
    }

    /// Remove `connection` from `form_id`. A no-op for non-members.
    pub fn leave(&self, form_id: &str, connection: &str) -> LeaveOutcome {
        let mut guard = self.inner.lock();
        let outcome = remove_member(&mut guard, form_id, connection);
        if outcome.was_member {
            info!("{connection} left form {form_id}");
        }
        outcome
    }

    /// Remove `connection` from every form it joined. Used on disconnect.
    pub fn leave_all(&self, connection: &str) -> Vec<(String, LeaveOutcome)> {
        let mut guard = self.inner.lock();
        let mut forms: Vec<String> = guard
            .joined
            .get(connection)
            .map(|f| f.iter().cloned().collect())
            .unwrap_or_default();
        forms.sort();

        let left: Vec<(String, LeaveOutcome)> = forms
            .into_iter()
            .map(|form_id| {
                let outcome = remove_member(&mut guard, &form_id, connection);
                (form_id, outcome)
            })
            .collect();
        if !left.is_empty() {
            info!("{connection} left {} form(s) on disconnect", left.len());
        }
        left
    }

    /// Handles of every member of `form_id`.
    pub fn members_of(&self, form_id: &str) -> Vec<ConnectionHandle> {
        self.inner
            .lock()
            .forms
            .get(form_id)
            .map(|s| s.members.values().map(|m| m.handle.clone()).collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, form_id: &str, connection: &str) -> bool {
        self.inner
            .lock()
            .forms
            .get(form_id)
            .is_some_and(|s| s.members.contains_key(connection))
    }

    /// The identity `connection` joined `form_id` with.
    /// Membership and joined identity read together: `None` for non-members,
    /// `Some(None)` for anonymous members.
    pub fn membership(&self, form_id: &str, connection: &str) -> Option<Option<Participant>> {
        self.inner
            .lock()
            .forms
            .get(form_id)?
            .members
            .get(connection)
            .map(|member| member.participant.clone())
    }

    pub fn participant(&self, form_id: &str, connection: &str) -> Option<Participant> {
        self.inner
            .lock()
            .forms
            .get(form_id)?
            .members
            .get(connection)?
            .participant
            .clone()
    }

    pub fn participants(&self, form_id: &str) -> Vec<Participant> {
        self.inner
            .lock()
            .forms
            .get(form_id)
            .map(|s| s.participants(None))
            .unwrap_or_default()
    }

    pub fn forms_of(&self, connection: &str) -> Vec<String> {
        let mut forms: Vec<String> = self
            .inner
            .lock()
            .joined
            .get(connection)
            .map(|f| f.iter().cloned().collect())
            .unwrap_or_default();
        forms.sort();
        forms
    }

    /// Queue `event` for every member of `form_id` except `except`.
    /// Returns how many outboxes accepted it.
    pub fn broadcast(&self, form_id: &str, except: Option<&str>, event: &ServerEvent) -> usize {
        self.inner
            .lock()
            .forms
            .get(form_id)
            .map(|s| s.broadcast(except, event))
            .unwrap_or(0)
    }

    /// Forms with at least one member.
    pub fn form_count(&self) -> usize {
        self.inner.lock().forms.len()
    }

    /// Connections that are a member of at least one form.
    pub fn connection_count(&self) -> usize {
        self.inner.lock().joined.len()
    }
}

fn remove_member(inner: &mut Inner, form_id: &str, connection: &str) -> LeaveOutcome {
    let Some(session) = inner.forms.get_mut(form_id) else {
        return LeaveOutcome::default();
    };
    let Some(member) = session.members.remove(connection) else {
        return LeaveOutcome::default();
    };

    if let Some(forms) = inner.joined.get_mut(connection) {
        forms.remove(form_id);
        if forms.is_empty() {
            inner.joined.remove(connection);
        }
    }

    let mut outcome = LeaveOutcome {
        was_member: true,
        ..Default::default()
    };

    if let Some(p) = member.participant {
        if !session.has_user(&p.user_id, connection) {
            let event = ServerEvent::UserLeft(UserLeft {
                form_id: form_id.to_string(),
                user_id: p.user_id,
            });
            outcome.announced = true;
            outcome.notified = session.broadcast(None, &event);
        }
    }

    if session.members.is_empty() {
        inner.forms.remove(form_id);
        outcome.form_closed = true;
        debug!("Form {form_id} closed");
    }
    outcome
}
