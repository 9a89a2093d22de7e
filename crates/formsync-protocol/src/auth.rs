//! Shared-token handshake that gates a connection before any form traffic.
//!
//! Protocol flow:
//!   1. Client connects to ws://host:port/ws
//!   2. Server sends: { method: "auth/required", params: { serverVersion, timeout } }
//!   3. Client sends: { method: "auth/handshake", id: "...", params: { token } }
//!   4. Server validates the token and responds, then sends "server/connected"
//!
//! This only keeps strangers off the socket. End-user identity travels in
//! `join-form` and is issued elsewhere.

use serde::{Deserialize, Serialize};

/// Parameters for the auth/handshake request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeParams {
    pub token: String,
    /// Free-form client label, logged on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
}

/// Parameters for the auth/required notification (sent on connect).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequiredParams {
    pub server_version: String,
    /// Milliseconds until an unauthenticated connection is closed
    pub timeout: u64,
}

/// Successful handshake response result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResult {
    pub connection_id: String,
    pub server_version: String,
}

/// Authentication state for a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Pending,
    Authenticated,
    Rejected,
}

/// Authentication-specific error codes (-32010 to -32019).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorCode {
    NotAuthenticated,
    InvalidToken,
    HandshakeTimeout,
}

impl AuthErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            Self::NotAuthenticated => -32010,
            Self::InvalidToken => -32011,
            Self::HandshakeTimeout => -32012,
        }
    }
}
