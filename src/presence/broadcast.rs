//! Online/offline announcements to every attached client.

use serde::{Deserialize, Serialize};

use crate::ws::broadcast::broadcast_to_all;
use crate::ws::protocol::ServerMessage;
use crate::ws::ConnectionTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

/// Fire-and-forget presence broadcasts. Only clients attached at the time of
/// the call receive the event.
#[derive(Clone)]
pub struct PresenceBroadcaster {
    connections: ConnectionTable,
}

impl PresenceBroadcaster {
    pub fn new(connections: ConnectionTable) -> Self {
        Self { connections }
    }

    pub fn online(&self, identity: &str) -> usize {
        self.announce(identity, PresenceStatus::Online)
    }

    /// Only call when the user has no newer connection; see
    /// `LifecycleController::close`.
    pub fn offline(&self, identity: &str) -> usize {
        self.announce(identity, PresenceStatus::Offline)
    }

    fn announce(&self, identity: &str, status: PresenceStatus) -> usize {
        let recipients = broadcast_to_all(
            &self.connections,
            &ServerMessage::Presence {
                user_identity: identity.to_string(),
                status,
            },
        );
        tracing::debug!(
            user_identity = %identity,
            status = status.as_str(),
            recipients,
            "Presence broadcast"
        );
        recipients
    }
}
