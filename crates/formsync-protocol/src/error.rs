//! Error codes and error objects carried on the wire.

use serde::{Deserialize, Serialize};

/// Standard JSON-RPC 2.0 error codes plus transport-level custom codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // JSON-RPC 2.0 standard errors
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,

    // Custom code
    Custom(i32),
}

impl ErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::Custom(c) => *c,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidParams,
            c => Self::Custom(c),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParseError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(ErrorCode::MethodNotFound, format!("Unknown event: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::from_code(self.code)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RPC error [{}]: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// Failure to turn an inbound frame into a typed client event.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not a JSON-RPC 2.0 message")]
    NotJsonRpc,

    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("invalid params for {event}: {reason}")]
    InvalidParams { event: &'static str, reason: String },
}

impl ProtocolError {
    pub(crate) fn invalid(event: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParams {
            event,
            reason: reason.into(),
        }
    }
}

impl From<&ProtocolError> for RpcError {
    fn from(err: &ProtocolError) -> Self {
        match err {
            ProtocolError::Json(e) => RpcError::parse_error(format!("Failed to parse JSON: {e}")),
            ProtocolError::NotJsonRpc => RpcError::invalid_request("Invalid JSON-RPC 2.0 message"),
            ProtocolError::UnknownEvent(name) => RpcError::method_not_found(name),
            ProtocolError::InvalidParams { .. } => RpcError::invalid_params(err.to_string()),
        }
    }
}

impl From<ProtocolError> for RpcError {
    fn from(err: ProtocolError) -> Self {
        RpcError::from(&err)
    }
}
