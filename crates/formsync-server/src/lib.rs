//! Collaboration core: presence, ordered fan-out and the gateway that ties
//! them to persistence.
//!
//! The gateway is an explicitly constructed service. It is handed its store
//! (and optionally its registry) up front and plugs into the transport as an
//! `EventHandler`.

pub mod channel;
pub mod gateway;
pub mod registry;

pub use channel::{DispatchSlot, FieldUpdateChannel, FieldUpdateEvent, Subscription};
pub use gateway::{
    CollaborationGateway, GatewayConfig, GatewayState, RejectReason, UpdateOutcome, entity_id,
};
pub use registry::{JoinOutcome, LeaveOutcome, SessionRegistry};
