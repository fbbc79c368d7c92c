pub mod actor;
pub mod broadcast;
pub mod handler;
pub mod protocol;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

use crate::presence::{ConnectionId, UserIdentity};

/// Sender half of a WebSocket connection's outbound channel.
/// Other parts of the system can clone this to push messages to a specific client.
pub type ConnectionSender = mpsc::UnboundedSender<axum::extract::ws::Message>;

/// An active connection attached to this process.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub user_identity: UserIdentity,
    pub sender: ConnectionSender,
    /// Wakes the connection's reader loop when it has to shut down (eviction).
    pub shutdown: Arc<Notify>,
}

/// Active connections on this process, keyed by connection id.
/// Only connections that finished registration are attached.
pub type ConnectionTable = Arc<DashMap<ConnectionId, ConnectionHandle>>;

/// Create a new empty connection table.
pub fn new_connection_table() -> ConnectionTable {
    Arc::new(DashMap::new())
}
