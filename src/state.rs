use crate::auth::admin::AdminSecret;
use crate::presence::{ConnectionRegistry, LifecycleController, TargetedDispatcher};
use crate::store::SharedIdentityStore;
use crate::ws::new_connection_table;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Connect/disconnect orchestration
    pub lifecycle: LifecycleController,
    /// Targeted server-to-client delivery
    pub dispatcher: TargetedDispatcher,
    /// HS256 key session tokens are signed with
    pub session_secret: Vec<u8>,
    /// Secret guarding the admin endpoints
    pub admin_secret: AdminSecret,
}

impl AppState {
    pub fn new(store: SharedIdentityStore, session_secret: Vec<u8>, admin_secret: AdminSecret) -> Self {
        let connections = new_connection_table();
        let registry = ConnectionRegistry::new(store);
        let lifecycle = LifecycleController::new(registry.clone(), connections.clone());
        let dispatcher = TargetedDispatcher::new(registry, connections);

        Self {
            lifecycle,
            dispatcher,
            session_secret,
            admin_secret,
        }
    }
}
