//! Presence and single-session arbitration.
//!
//! The identity store holds a forward key `uid:<identity>` pointing at the
//! user's current connection and a reverse key `sid:<connection>` pointing back
//! at the user. All writes to those keys go through [`ConnectionRegistry`].

pub mod broadcast;
pub mod dispatch;
pub mod lifecycle;
pub mod registry;

pub use broadcast::{PresenceBroadcaster, PresenceStatus};
pub use dispatch::{Delivery, TargetedDispatcher};
pub use lifecycle::{Activation, ConnectionLifecycle, ConnectionState, LifecycleController};
pub use registry::ConnectionRegistry;

/// Opaque authenticated user key supplied by the session layer.
pub type UserIdentity = String;

/// Opaque identifier of one live transport connection.
pub type ConnectionId = String;

/// Store key holding the user's current connection id.
pub fn forward_key(identity: &str) -> String {
    format!("uid:{}", identity)
}

/// Store key holding the user attached to a connection.
pub fn reverse_key(connection_id: &str) -> String {
    format!("sid:{}", connection_id)
}

/// Generate a fresh connection id (UUIDv7).
pub fn new_connection_id() -> ConnectionId {
    uuid::Uuid::now_v7().to_string()
}
