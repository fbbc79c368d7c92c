//! Per-connection state machine: `Connecting -> Validating -> Active -> Closed`.
//!
//! The controller drives a [`ConnectionLifecycle`] through its states, talking
//! to the registry, the broadcaster, and the local connection table at each
//! transition. A connection only reaches `Active` after the store confirmed
//! its mapping.

use std::sync::Arc;
use tokio::sync::Notify;

use super::{ConnectionId, ConnectionRegistry, PresenceBroadcaster, UserIdentity};
use crate::auth::session::{SessionClaims, SessionRejection};
use crate::error::PresenceError;
use crate::ws::broadcast::{force_close_connection, send_to_connection};
use crate::ws::protocol::{ServerMessage, CLOSE_SESSION_CONFLICT};
use crate::ws::{ConnectionHandle, ConnectionSender, ConnectionTable};

const CONFLICT_MESSAGE: &str = "Your session was opened from another connection";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Validating,
    Active,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Validating)
                | (Connecting, Closed)
                | (Validating, Active)
                | (Validating, Closed)
                | (Active, Closed)
        )
    }
}

/// State of one transport connection.
#[derive(Debug)]
pub struct ConnectionLifecycle {
    connection_id: ConnectionId,
    state: ConnectionState,
    identity: Option<UserIdentity>,
}

impl ConnectionLifecycle {
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            state: ConnectionState::Connecting,
            identity: None,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    fn transition(&mut self, next: ConnectionState) -> Result<(), PresenceError> {
        if !self.state.can_transition_to(next) {
            return Err(PresenceError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

/// What happened when a connection became active.
#[derive(Debug)]
pub struct Activation {
    /// Notified when this connection gets evicted.
    pub shutdown: Arc<Notify>,
    /// Prior connection that was told to go away, if any.
    pub evicted: Option<ConnectionId>,
    /// False when the user was already mapped and this was a takeover.
    pub announced_online: bool,
}

#[derive(Clone)]
pub struct LifecycleController {
    registry: ConnectionRegistry,
    broadcaster: PresenceBroadcaster,
    connections: ConnectionTable,
}

impl LifecycleController {
    pub fn new(registry: ConnectionRegistry, connections: ConnectionTable) -> Self {
        Self {
            registry,
            broadcaster: PresenceBroadcaster::new(connections.clone()),
            connections,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Gate on the reloaded session. A failed reload or an empty identity
    /// closes the connection without touching the registry.
    pub fn validate(
        &self,
        lc: &mut ConnectionLifecycle,
        reloaded: Result<SessionClaims, SessionRejection>,
    ) -> Result<UserIdentity, PresenceError> {
        lc.transition(ConnectionState::Validating)?;

        let identity = reloaded.and_then(|claims| {
            if claims.sub.is_empty() {
                Err(SessionRejection::NoIdentity)
            } else {
                Ok(claims.sub)
            }
        });

        match identity {
            Ok(identity) => {
                lc.identity = Some(identity.clone());
                Ok(identity)
            }
            Err(rejection) => {
                lc.transition(ConnectionState::Closed)?;
                Err(PresenceError::SessionInvalid(rejection))
            }
        }
    }

    /// Attach the validated connection to the local table, register it, evict
    /// any prior one, and announce the user if they were not online before.
    ///
    /// The handle is attached before `register` so that a concurrent takeover
    /// for the same identity always finds it to evict. A failed registration
    /// detaches it again.
    pub async fn activate(
        &self,
        lc: &mut ConnectionLifecycle,
        sender: ConnectionSender,
    ) -> Result<Activation, PresenceError> {
        if lc.state != ConnectionState::Validating {
            return Err(PresenceError::InvalidTransition {
                from: lc.state,
                to: ConnectionState::Active,
            });
        }
        let identity = lc
            .identity
            .clone()
            .ok_or(PresenceError::SessionInvalid(SessionRejection::NoIdentity))?;

        let shutdown = Arc::new(Notify::new());
        self.connections.insert(
            lc.connection_id.clone(),
            ConnectionHandle {
                user_identity: identity.clone(),
                sender,
                shutdown: shutdown.clone(),
            },
        );

        let prior = match self.registry.register(&identity, &lc.connection_id).await {
            Ok(prior) => prior,
            Err(e) => {
                self.connections.remove(&lc.connection_id);
                tracing::warn!(
                    user_identity = %identity,
                    connection_id = %lc.connection_id,
                    error = %e,
                    "Registration failed, connection not activated"
                );
                lc.transition(ConnectionState::Closed)?;
                return Err(e);
            }
        };
        lc.transition(ConnectionState::Active)?;

        let evicted = prior.clone().filter(|p| *p != lc.connection_id);
        if let Some(prior_id) = &evicted {
            self.evict(prior_id, &identity);
        }

        let announced_online = prior.is_none();
        if announced_online {
            self.broadcaster.online(&identity);
        }

        Ok(Activation {
            shutdown,
            evicted,
            announced_online,
        })
    }

    /// Tell the superseded connection why and close it. Fire-and-forget: the
    /// prior connection may live on another process or already be gone.
    fn evict(&self, prior_id: &str, identity: &str) {
        let notified = send_to_connection(
            &self.connections,
            prior_id,
            &ServerMessage::Conflict {
                message: CONFLICT_MESSAGE.to_string(),
            },
        );
        force_close_connection(
            &self.connections,
            prior_id,
            CLOSE_SESSION_CONFLICT,
            "Session replaced",
        );
        tracing::info!(
            user_identity = %identity,
            prior_connection_id = %prior_id,
            attached = notified,
            "Evicted superseded connection"
        );
    }

    /// Tear down a connection. Returns true when the user went offline, i.e.
    /// no newer connection had taken over the mapping.
    pub async fn close(&self, lc: &mut ConnectionLifecycle) -> Result<bool, PresenceError> {
        match lc.state {
            ConnectionState::Closed => Ok(false),
            ConnectionState::Connecting | ConnectionState::Validating => {
                lc.transition(ConnectionState::Closed)?;
                Ok(false)
            }
            ConnectionState::Active => {
                lc.transition(ConnectionState::Closed)?;
                self.connections.remove(&lc.connection_id);

                let Some(identity) = lc.identity.as_deref() else {
                    return Ok(false);
                };
                let removed = self.registry.unregister(&lc.connection_id, identity).await?;
                if removed {
                    self.broadcaster.offline(identity);
                } else {
                    tracing::debug!(
                        user_identity = %identity,
                        connection_id = %lc.connection_id,
                        "Superseded connection closed, offline suppressed"
                    );
                }
                Ok(removed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceStatus;
    use crate::store::flaky::{FlakyStore, Op};
    use crate::store::{IdentityStore, MemoryIdentityStore, SqliteIdentityStore, StoreError};
    use crate::ws::new_connection_table;
    use async_trait::async_trait;
    use axum::extract::ws::Message;
    use tokio::sync::mpsc;

    struct Harness {
        controller: LifecycleController,
        store: Arc<MemoryIdentityStore>,
        table: ConnectionTable,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryIdentityStore::new());
        let table = new_connection_table();
        let controller =
            LifecycleController::new(ConnectionRegistry::new(store.clone()), table.clone());
        Harness {
            controller,
            store,
            table,
        }
    }

    fn claims(sub: &str) -> Result<SessionClaims, SessionRejection> {
        Ok(SessionClaims {
            sub: sub.to_string(),
            iat: 0,
            exp: i64::MAX,
        })
    }

    struct Client {
        lc: ConnectionLifecycle,
        rx: mpsc::UnboundedReceiver<Message>,
        activation: Activation,
    }

    async fn connect(h: &Harness, id: &str, identity: &str) -> Client {
        let mut lc = ConnectionLifecycle::new(id.to_string());
        h.controller.validate(&mut lc, claims(identity)).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let activation = h.controller.activate(&mut lc, tx).await.unwrap();
        Client { lc, rx, activation }
    }

    /// Drain everything queued for a client.
    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> (Vec<ServerMessage>, Vec<u16>) {
        let mut messages = Vec::new();
        let mut closes = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            match frame {
                Message::Text(text) => messages.push(serde_json::from_str(text.as_str()).unwrap()),
                Message::Close(Some(frame)) => closes.push(frame.code),
                _ => {}
            }
        }
        (messages, closes)
    }

    fn presence(identity: &str, status: PresenceStatus) -> ServerMessage {
        ServerMessage::Presence {
            user_identity: identity.to_string(),
            status,
        }
    }

    #[test]
    fn test_transition_guards() {
        use ConnectionState::*;
        assert!(Connecting.can_transition_to(Validating));
        assert!(Validating.can_transition_to(Active));
        assert!(Active.can_transition_to(Closed));
        assert!(!Connecting.can_transition_to(Active));
        assert!(!Closed.can_transition_to(Active));
        assert!(!Active.can_transition_to(Validating));
    }

    #[tokio::test]
    async fn test_invalid_session_closes_without_registry_writes() {
        let h = harness();
        let mut lc = ConnectionLifecycle::new("c1".to_string());

        let err = h
            .controller
            .validate(&mut lc, Err(SessionRejection::Expired))
            .unwrap_err();
        assert!(matches!(err, PresenceError::SessionInvalid(SessionRejection::Expired)));
        assert_eq!(lc.state(), ConnectionState::Closed);
        assert!(h.store.is_empty());
        assert!(!h.controller.close(&mut lc).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_identity_is_rejected() {
        let h = harness();
        let mut lc = ConnectionLifecycle::new("c1".to_string());
        let err = h.controller.validate(&mut lc, claims("")).unwrap_err();
        assert!(matches!(
            err,
            PresenceError::SessionInvalid(SessionRejection::NoIdentity)
        ));
        assert_eq!(lc.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_activate_requires_validation() {
        let h = harness();
        let mut lc = ConnectionLifecycle::new("c1".to_string());
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = h.controller.activate(&mut lc, tx).await.unwrap_err();
        assert!(matches!(
            err,
            PresenceError::InvalidTransition {
                from: ConnectionState::Connecting,
                to: ConnectionState::Active
            }
        ));
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_first_connection_goes_online() {
        let h = harness();
        let mut a = connect(&h, "A", "u1").await;

        assert_eq!(a.lc.state(), ConnectionState::Active);
        assert!(a.activation.announced_online);
        assert_eq!(a.activation.evicted, None);
        let (messages, _) = drain(&mut a.rx);
        assert_eq!(messages, vec![presence("u1", PresenceStatus::Online)]);
    }

    #[tokio::test]
    async fn test_takeover_then_disconnect_scenario() {
        let h = harness();
        let mut observer = connect(&h, "O", "watcher").await;
        drain(&mut observer.rx);

        let mut a = connect(&h, "A", "u1").await;
        let (seen, _) = drain(&mut observer.rx);
        assert_eq!(seen, vec![presence("u1", PresenceStatus::Online)]);
        drain(&mut a.rx);

        // B takes over: A gets the conflict notice and a close frame.
        let mut b = connect(&h, "B", "u1").await;
        assert_eq!(b.activation.evicted, Some("A".to_string()));
        assert!(!b.activation.announced_online);

        let (a_messages, a_closes) = drain(&mut a.rx);
        assert!(matches!(a_messages.as_slice(), [ServerMessage::Conflict { .. }]));
        assert_eq!(a_closes, vec![CLOSE_SESSION_CONFLICT]);
        tokio::time::timeout(
            std::time::Duration::from_millis(100),
            a.activation.shutdown.notified(),
        )
        .await
        .expect("evicted connection should be woken");

        // No re-broadcast of online.
        let (seen, _) = drain(&mut observer.rx);
        assert!(seen.is_empty());
        assert_eq!(
            h.controller.registry().lookup("u1").await.unwrap(),
            Some("B".to_string())
        );

        // A finishes closing: mapping stays with B, no offline.
        assert!(!h.controller.close(&mut a.lc).await.unwrap());
        let (seen, _) = drain(&mut observer.rx);
        assert!(seen.is_empty());
        assert_eq!(
            h.controller.registry().lookup("u1").await.unwrap(),
            Some("B".to_string())
        );

        // B disconnects: exactly one offline.
        assert!(h.controller.close(&mut b.lc).await.unwrap());
        let (seen, _) = drain(&mut observer.rx);
        assert_eq!(seen, vec![presence("u1", PresenceStatus::Offline)]);
        assert_eq!(h.store.get("uid:u1").await.unwrap(), None);
        assert_eq!(h.store.get("sid:B").await.unwrap(), None);
        assert_eq!(h.store.get("sid:A").await.unwrap(), None);
        assert!(!h.table.contains_key("A"));
        assert!(!h.table.contains_key("B"));
        drain(&mut b.rx);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let h = harness();
        let mut observer = connect(&h, "O", "watcher").await;
        let mut a = connect(&h, "A", "u1").await;
        drain(&mut observer.rx);

        assert!(h.controller.close(&mut a.lc).await.unwrap());
        assert!(!h.controller.close(&mut a.lc).await.unwrap());
        let (seen, _) = drain(&mut observer.rx);
        assert_eq!(seen, vec![presence("u1", PresenceStatus::Offline)]);
        drain(&mut a.rx);
    }

    struct UnreachableStore;

    #[async_trait]
    impl IdentityStore for UnreachableStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Backend("connection refused".to_string()))
        }
        async fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend("connection refused".to_string()))
        }
        async fn del(&self, _key: &str) -> Result<bool, StoreError> {
            Err(StoreError::Backend("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_never_activates() {
        let table = new_connection_table();
        let controller =
            LifecycleController::new(ConnectionRegistry::new(Arc::new(UnreachableStore)), table.clone());

        let mut lc = ConnectionLifecycle::new("c1".to_string());
        controller.validate(&mut lc, claims("u1")).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let err = controller.activate(&mut lc, tx).await.unwrap_err();

        assert!(matches!(err, PresenceError::StoreUnavailable(_)));
        assert_eq!(lc.state(), ConnectionState::Closed);
        assert!(table.is_empty());
        assert!(rx.try_recv().is_err());
        assert!(!controller.close(&mut lc).await.unwrap());
    }

    async fn connect_to(
        controller: &LifecycleController,
        id: &str,
        identity: &str,
    ) -> (ConnectionLifecycle, mpsc::UnboundedReceiver<Message>, Result<Activation, PresenceError>) {
        let mut lc = ConnectionLifecycle::new(id.to_string());
        controller.validate(&mut lc, claims(identity)).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let activation = controller.activate(&mut lc, tx).await;
        (lc, rx, activation)
    }

    #[tokio::test]
    async fn test_failed_takeover_keeps_prior_session_online() {
        let store = Arc::new(FlakyStore::new());
        let table = new_connection_table();
        let controller = LifecycleController::new(ConnectionRegistry::new(store.clone()), table.clone());

        let (_o_lc, mut observer, _) = connect_to(&controller, "O", "watcher").await;
        let (mut a_lc, mut a_rx, _) = connect_to(&controller, "A", "u1").await;
        drain(&mut observer);
        drain(&mut a_rx);

        store.fail(Op::Set, "sid:");
        let (b_lc, _b_rx, b) = connect_to(&controller, "B", "u1").await;
        assert!(matches!(b, Err(PresenceError::StoreUnavailable(_))));
        assert_eq!(b_lc.state(), ConnectionState::Closed);
        assert!(!table.contains_key("B"));

        // A was not evicted and still owns the mapping.
        let (a_messages, a_closes) = drain(&mut a_rx);
        assert!(a_messages.is_empty());
        assert!(a_closes.is_empty());
        assert_eq!(store.inner().get("uid:u1").await.unwrap(), Some("A".to_string()));

        store.heal();
        assert!(controller.close(&mut a_lc).await.unwrap());
        let (seen, _) = drain(&mut observer);
        assert_eq!(seen, vec![presence("u1", PresenceStatus::Offline)]);
        assert_eq!(store.inner().get("uid:u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_prior_cleanup_still_takes_over() {
        let store = Arc::new(FlakyStore::new());
        let table = new_connection_table();
        let controller = LifecycleController::new(ConnectionRegistry::new(store.clone()), table.clone());

        let (_o_lc, mut observer, _) = connect_to(&controller, "O", "watcher").await;
        let (mut a_lc, mut a_rx, _) = connect_to(&controller, "A", "u1").await;
        drain(&mut observer);
        drain(&mut a_rx);

        store.fail(Op::DelIfEq, "sid:");
        let (mut b_lc, mut b_rx, b) = connect_to(&controller, "B", "u1").await;
        assert_eq!(b.unwrap().evicted, Some("A".to_string()));
        assert_eq!(b_lc.state(), ConnectionState::Active);
        let (_, a_closes) = drain(&mut a_rx);
        assert_eq!(a_closes, vec![CLOSE_SESSION_CONFLICT]);
        store.heal();

        assert!(!controller.close(&mut a_lc).await.unwrap());
        assert!(controller.close(&mut b_lc).await.unwrap());
        let (seen, _) = drain(&mut observer);
        assert_eq!(seen, vec![presence("u1", PresenceStatus::Offline)]);
        assert_eq!(store.inner().get("uid:u1").await.unwrap(), None);
        assert_eq!(store.inner().get("sid:A").await.unwrap(), None);
        drain(&mut b_rx);
    }

    /// Records whether the connection was attached when its forward key was
    /// written.
    struct AttachCheckingStore {
        inner: MemoryIdentityStore,
        table: ConnectionTable,
        attached_at_swap: std::sync::Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl IdentityStore for AttachCheckingStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            self.inner.set(key, value).await
        }
        async fn del(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.del(key).await
        }
        async fn swap(&self, key: &str, value: &str) -> Result<Option<String>, StoreError> {
            self.attached_at_swap
                .lock()
                .unwrap()
                .push(self.table.contains_key(value));
            self.inner.swap(key, value).await
        }
    }

    #[tokio::test]
    async fn test_connection_is_attached_before_its_mapping_exists() {
        let table = new_connection_table();
        let store = Arc::new(AttachCheckingStore {
            inner: MemoryIdentityStore::new(),
            table: table.clone(),
            attached_at_swap: std::sync::Mutex::new(Vec::new()),
        });
        let controller = LifecycleController::new(ConnectionRegistry::new(store.clone()), table);

        connect_to(&controller, "A", "u1").await.2.unwrap();
        connect_to(&controller, "B", "u1").await.2.unwrap();
        assert_eq!(*store.attached_at_swap.lock().unwrap(), vec![true, true]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_takeovers_leave_one_live_connection() {
        let h = harness();
        let mut tasks = Vec::new();
        for i in 0..16 {
            let controller = h.controller.clone();
            tasks.push(tokio::spawn(async move {
                let id = format!("c{}", i);
                let (lc, rx, activation) = connect_to(&controller, &id, "u1").await;
                (lc, rx, activation.unwrap())
            }));
        }
        let mut clients = Vec::new();
        for t in tasks {
            clients.push(t.await.unwrap());
        }

        let current = h.controller.registry().lookup("u1").await.unwrap().unwrap();
        for (lc, mut rx, activation) in clients {
            let superseded = lc.connection_id() != current;
            let woken = tokio::time::timeout(
                std::time::Duration::from_millis(50),
                activation.shutdown.notified(),
            )
            .await
            .is_ok();
            assert_eq!(woken, superseded, "connection {}", lc.connection_id());
            let (_, closes) = drain(&mut rx);
            assert_eq!(!closes.is_empty(), superseded, "connection {}", lc.connection_id());
        }
    }

    #[tokio::test]
    async fn test_takeover_over_sqlite_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteIdentityStore::open(dir.path().to_str().unwrap()).unwrap());
        let controller =
            LifecycleController::new(ConnectionRegistry::new(store.clone()), new_connection_table());

        let (mut a_lc, mut a_rx, a) = connect_to(&controller, "A", "u1").await;
        assert!(a.unwrap().announced_online);
        drain(&mut a_rx);

        let (mut b_lc, mut b_rx, b) = connect_to(&controller, "B", "u1").await;
        let b = b.unwrap();
        assert_eq!(b.evicted, Some("A".to_string()));
        assert!(!b.announced_online);
        let (_, a_closes) = drain(&mut a_rx);
        assert_eq!(a_closes, vec![CLOSE_SESSION_CONFLICT]);

        assert!(!controller.close(&mut a_lc).await.unwrap());
        assert_eq!(store.get("uid:u1").await.unwrap(), Some("B".to_string()));
        assert!(controller.close(&mut b_lc).await.unwrap());
        assert_eq!(store.get("uid:u1").await.unwrap(), None);
        assert_eq!(store.get("sid:A").await.unwrap(), None);
        assert_eq!(store.get("sid:B").await.unwrap(), None);
        drain(&mut b_rx);
    }
}
