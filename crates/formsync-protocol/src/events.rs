//! Collaboration events: the closed set of messages exchanged over a session.
//!
//! Inbound frames are resolved to a [`ClientEvent`] here, at the boundary, so
//! nothing downstream ever sees loosely-typed params. Outbound traffic is a
//! [`ServerEvent`], encoded as a JSON-RPC notification.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::jsonrpc::Notification;

/// Event names exactly as they appear in the `method` field.
pub struct Events;

impl Events {
    // ── Client → server ─────────────────────────────────────────────────
    pub const JOIN_FORM: &str = "join-form";
    pub const LEAVE_FORM: &str = "leave-form";
    pub const FIELD_UPDATE: &str = "field-update";

    // ── Server → client ─────────────────────────────────────────────────
    pub const FIELD_UPDATED: &str = "field-updated";
    pub const FIELD_UPDATE_ERROR: &str = "field-update-error";
    pub const FORM_PRESENCE: &str = "form-presence";

    // ── Both directions ─────────────────────────────────────────────────
    // Older clients announce presence with these after `join-form`; the
    // server sends them to peers when presence changes.
    pub const USER_JOINED: &str = "user-joined";
    pub const USER_LEFT: &str = "user-left";

    // ── Connection lifecycle ────────────────────────────────────────────
    pub const SERVER_CONNECTED: &str = "server/connected";
    pub const AUTH_REQUIRED: &str = "auth/required";
    pub const AUTH_HANDSHAKE: &str = "auth/handshake";
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared payload types
// ─────────────────────────────────────────────────────────────────────────────

/// Application-level identity attached to a connection inside one form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Participant {
    pub fn new(user_id: impl Into<String>, email: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client → Server
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinForm {
    pub form_id: String,
    pub participant: Option<Participant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveForm {
    pub form_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldUpdate {
    pub form_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    pub field_id: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Every message a client may send once the connection is established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    JoinForm(JoinForm),
    LeaveForm(LeaveForm),
    FieldUpdate(FieldUpdate),
}

/// `join-form` / `leave-form` params: an object, or just the form id.
#[derive(Deserialize)]
#[serde(untagged)]
enum FormRef {
    Id(String),
    Object(FormRefObject),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FormRefObject {
    form_id: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

impl FormRef {
    fn into_parts(self) -> (String, Option<Participant>) {
        match self {
            FormRef::Id(form_id) => (form_id, None),
            FormRef::Object(obj) => {
                let participant = obj
                    .user_id
                    .filter(|id| !id.is_empty())
                    .map(|id| Participant::new(id, obj.email));
                (obj.form_id, participant)
            }
        }
    }
}

fn form_ref(event: &'static str, params: Option<Value>) -> Result<(String, Option<Participant>), ProtocolError> {
    let params = params.ok_or_else(|| ProtocolError::invalid(event, "missing params"))?;
    let form_ref: FormRef = serde_json::from_value(params)
        .map_err(|e| ProtocolError::invalid(event, e.to_string()))?;
    let (form_id, participant) = form_ref.into_parts();
    if form_id.is_empty() {
        return Err(ProtocolError::invalid(event, "formId must not be empty"));
    }
    Ok((form_id, participant))
}

impl ClientEvent {
    /// Resolve a method name and its params to a typed event.
    pub fn decode(method: &str, params: Option<Value>) -> Result<Self, ProtocolError> {
        match method {
            Events::JOIN_FORM => {
                let (form_id, participant) = form_ref(Events::JOIN_FORM, params)?;
                Ok(Self::JoinForm(JoinForm { form_id, participant }))
            }
            // Legacy presence announcement: identity is mandatory here.
            Events::USER_JOINED => {
                let (form_id, participant) = form_ref(Events::USER_JOINED, params)?;
                let participant = participant
                    .ok_or_else(|| ProtocolError::invalid(Events::USER_JOINED, "userId is required"))?;
                Ok(Self::JoinForm(JoinForm {
                    form_id,
                    participant: Some(participant),
                }))
            }
            Events::LEAVE_FORM => {
                let (form_id, _) = form_ref(Events::LEAVE_FORM, params)?;
                Ok(Self::LeaveForm(LeaveForm { form_id }))
            }
            Events::USER_LEFT => {
                let (form_id, _) = form_ref(Events::USER_LEFT, params)?;
                Ok(Self::LeaveForm(LeaveForm { form_id }))
            }
            Events::FIELD_UPDATE => {
                let params = params
                    .ok_or_else(|| ProtocolError::invalid(Events::FIELD_UPDATE, "missing params"))?;
                let update: FieldUpdate = serde_json::from_value(params)
                    .map_err(|e| ProtocolError::invalid(Events::FIELD_UPDATE, e.to_string()))?;
                if update.form_id.is_empty() {
                    return Err(ProtocolError::invalid(Events::FIELD_UPDATE, "formId must not be empty"));
                }
                if update.field_id.is_empty() {
                    return Err(ProtocolError::invalid(Events::FIELD_UPDATE, "fieldId must not be empty"));
                }
                Ok(Self::FieldUpdate(update))
            }
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }

    pub fn form_id(&self) -> &str {
        match self {
            Self::JoinForm(e) => &e.form_id,
            Self::LeaveForm(e) => &e.form_id,
            Self::FieldUpdate(e) => &e.form_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinForm(_) => Events::JOIN_FORM,
            Self::LeaveForm(_) => Events::LEAVE_FORM,
            Self::FieldUpdate(_) => Events::FIELD_UPDATE,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server → Client
// ─────────────────────────────────────────────────────────────────────────────

/// Welcome sent once a connection is usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connected {
    pub connection_id: String,
    pub server_version: String,
}

/// A committed field value, fanned out to every peer except the author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldUpdated {
    pub form_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    pub field_id: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Arrival order at the server.
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserJoined {
    pub form_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeft {
    pub form_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldUpdateError {
    pub form_id: String,
    pub field_id: String,
    pub error: String,
}

/// Identified participants already in a form, sent to a connection that joins it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormPresence {
    pub form_id: String,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Connected(Connected),
    FieldUpdated(FieldUpdated),
    UserJoined(UserJoined),
    UserLeft(UserLeft),
    FieldUpdateError(FieldUpdateError),
    FormPresence(FormPresence),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected(_) => Events::SERVER_CONNECTED,
            Self::FieldUpdated(_) => Events::FIELD_UPDATED,
            Self::UserJoined(_) => Events::USER_JOINED,
            Self::UserLeft(_) => Events::USER_LEFT,
            Self::FieldUpdateError(_) => Events::FIELD_UPDATE_ERROR,
            Self::FormPresence(_) => Events::FORM_PRESENCE,
        }
    }

    pub fn to_notification(&self) -> Notification {
        let params = match self {
            Self::Connected(p) => serde_json::to_value(p),
            Self::FieldUpdated(p) => serde_json::to_value(p),
            Self::UserJoined(p) => serde_json::to_value(p),
            Self::UserLeft(p) => serde_json::to_value(p),
            Self::FieldUpdateError(p) => serde_json::to_value(p),
            Self::FormPresence(p) => serde_json::to_value(p),
        };
        Notification::new(self.name(), params.ok())
    }

    /// Encode as a text frame.
    pub fn to_text(&self) -> String {
        serde_json::to_string(&self.to_notification()).unwrap_or_default()
    }

    /// Decode a server notification. Used by clients and tests.
    pub fn decode(method: &str, params: Option<Value>) -> Result<Self, ProtocolError> {
        fn payload<T: serde::de::DeserializeOwned>(
            event: &'static str,
            params: Option<Value>,
        ) -> Result<T, ProtocolError> {
            let params = params.ok_or_else(|| ProtocolError::invalid(event, "missing params"))?;
            serde_json::from_value(params).map_err(|e| ProtocolError::invalid(event, e.to_string()))
        }

        match method {
            Events::SERVER_CONNECTED => Ok(Self::Connected(payload(Events::SERVER_CONNECTED, params)?)),
            Events::FIELD_UPDATED => Ok(Self::FieldUpdated(payload(Events::FIELD_UPDATED, params)?)),
            Events::USER_JOINED => Ok(Self::UserJoined(payload(Events::USER_JOINED, params)?)),
            Events::USER_LEFT => Ok(Self::UserLeft(payload(Events::USER_LEFT, params)?)),
            Events::FIELD_UPDATE_ERROR => {
                Ok(Self::FieldUpdateError(payload(Events::FIELD_UPDATE_ERROR, params)?))
            }
            Events::FORM_PRESENCE => Ok(Self::FormPresence(payload(Events::FORM_PRESENCE, params)?)),
            other => Err(ProtocolError::UnknownEvent(other.to_string())),
        }
    }
}
