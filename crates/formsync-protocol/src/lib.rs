//! Form collaboration protocol types.
//!
//! JSON-RPC 2.0 framed, notification-only event vocabulary for live form
//! sessions. This crate is the single source of truth for event names,
//! payload shapes and error codes.

pub mod auth;
pub mod error;
pub mod events;
pub mod jsonrpc;

pub use auth::{AuthErrorCode, AuthRequiredParams, AuthState, HandshakeParams, HandshakeResult};
pub use error::{ErrorCode, ProtocolError, RpcError};
pub use events::{
    ClientEvent, Connected, Events, FieldUpdate, FieldUpdateError, FieldUpdated, FormPresence,
    JoinForm, LeaveForm, Participant, ServerEvent, UserJoined, UserLeft,
};
pub use jsonrpc::{Inbound, Notification, RequestId, Response};

/// Version reported in `server/connected` and the handshake.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
