//! JSON-RPC 2.0 framing.
//!
//! Collaboration traffic is one-way notifications in both directions. The
//! only request/response exchange is the optional `auth/handshake`, and error
//! responses are used to reject frames that never became a typed event.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, RpcError};

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request ID: either a string or integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

/// JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.into(),
            params,
        }
    }
}

/// Any inbound frame, before the method is resolved to a typed event.
///
/// `id` is only meaningful for the handshake; collaboration events ignore it
/// apart from echoing it back on a protocol error.
#[derive(Debug, Clone, Deserialize)]
pub struct Inbound {
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<RequestId>,
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Inbound {
    /// Parse a text frame. Fails with `Json` on malformed input and
    /// `NotJsonRpc` when the version tag or method is missing.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let inbound: Inbound = serde_json::from_str(text)?;
        if inbound.jsonrpc.as_deref() != Some(JSONRPC_VERSION) || inbound.method.is_none() {
            return Err(ProtocolError::NotJsonRpc);
        }
        Ok(inbound)
    }

    pub fn method(&self) -> &str {
        self.method.as_deref().unwrap_or_default()
    }
}

/// Best-effort id extraction from a frame that failed to parse as [`Inbound`].
pub fn salvage_id(text: &str) -> Option<RequestId> {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("id").cloned())
        .and_then(|v| serde_json::from_value(v).ok())
}

/// JSON-RPC 2.0 success response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub result: Value,
}

/// JSON-RPC 2.0 error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    pub error: RpcError,
}

/// JSON-RPC 2.0 response (success or error).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Success(SuccessResponse),
    Error(ErrorResponse),
}

impl Response {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self::Success(SuccessResponse {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result,
        })
    }

    pub fn error(id: Option<RequestId>, error: RpcError) -> Self {
        Self::Error(ErrorResponse {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            error,
        })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Serialize to a text frame.
    pub fn to_text(&self) -> String {
        // A Response holds only strings, numbers and already-valid JSON values.
        serde_json::to_string(self).unwrap_or_default()
    }
}
