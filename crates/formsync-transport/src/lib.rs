//! Collaboration transport layer.
//!
//! Owns the WebSocket listener and every socket task:
//! - Connection lifecycle (open, frame, close)
//! - Optional shared-token handshake
//! - Heartbeat pings and stale connection detection
//! - Draining each connection's bounded outbox
//!
//! Session semantics live behind the `EventHandler` trait.

pub mod client;
pub mod server;

pub use client::{ClientConnection, ConnectionHandle, ConnectionId};
pub use server::{AuthConfig, EventHandler, TransportConfig, TransportError, TransportServer};
