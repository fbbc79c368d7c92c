use serde_json::Value;

use super::{ConnectionId, ConnectionRegistry};
use crate::error::PresenceError;
use crate::ws::broadcast::send_to_connection;
use crate::ws::protocol::ServerMessage;
use crate::ws::ConnectionTable;

/// Result of a successful targeted delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Connection the payload was queued on.
    pub connection_id: ConnectionId,
}

/// Routes server-initiated messages to a user's current connection.
///
/// Callers are expected to have authorized the request already.
#[derive(Clone)]
pub struct TargetedDispatcher {
    registry: ConnectionRegistry,
    connections: ConnectionTable,
}

impl TargetedDispatcher {
    pub fn new(registry: ConnectionRegistry, connections: ConnectionTable) -> Self {
        Self {
            registry,
            connections,
        }
    }

    /// Queue `payload` for the user's current connection, and only that one.
    ///
    /// Returns `UserNotFound` when the user has no mapping, or when the mapped
    /// connection is not attached to this process.
    pub async fn deliver(&self, identity: &str, payload: Value) -> Result<Delivery, PresenceError> {
        let connection_id = self
            .registry
            .lookup(identity)
            .await?
            .ok_or(PresenceError::UserNotFound)?;

        if !send_to_connection(
            &self.connections,
            &connection_id,
            &ServerMessage::Notification { payload },
        ) {
            tracing::debug!(
                user_identity = %identity,
                connection_id = %connection_id,
                "Mapped connection not attached here"
            );
            return Err(PresenceError::UserNotFound);
        }

        tracing::debug!(
            user_identity = %identity,
            connection_id = %connection_id,
            "Notification delivered"
        );
        Ok(Delivery { connection_id })
    }

    /// Whether the user currently has a live mapping.
    pub async fn is_online(&self, identity: &str) -> Result<bool, PresenceError> {
        Ok(self.registry.lookup(identity).await?.is_some())
    }
}
