use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{forward_key, reverse_key, ConnectionId};
use crate::error::PresenceError;
use crate::store::SharedIdentityStore;

/// Number of lock stripes used to serialize work per identity.
const LOCK_STRIPES: usize = 64;

/// Enforces single-session-per-user on top of the identity store.
///
/// `register` and `unregister` for the same identity are serialized through a
/// striped async lock, so the unregister guard never interleaves with a
/// register for that identity on this process. Across processes the store's
/// per-key atomicity decides: the last `register` wins.
#[derive(Clone)]
pub struct ConnectionRegistry {
    store: SharedIdentityStore,
    stripes: Arc<[Mutex<()>; LOCK_STRIPES]>,
}

impl ConnectionRegistry {
    pub fn new(store: SharedIdentityStore) -> Self {
        Self {
            store,
            stripes: Arc::new(std::array::from_fn(|_| Mutex::new(()))),
        }
    }

    pub fn store(&self) -> &SharedIdentityStore {
        &self.store
    }

    fn stripe(&self, identity: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        identity.hash(&mut hasher);
        &self.stripes[(hasher.finish() % LOCK_STRIPES as u64) as usize]
    }

    /// Point `identity` at `connection_id`, returning the connection it
    /// pointed at before (the conflict signal).
    ///
    /// On error the forward key is put back to what it held before, so the
    /// prior connection keeps its mapping. A superseded connection loses its
    /// reverse key here when the store allows it; otherwise its own
    /// `unregister` clears it.
    pub async fn register(
        &self,
        identity: &str,
        connection_id: &str,
    ) -> Result<Option<ConnectionId>, PresenceError> {
        let _guard = self.stripe(identity).lock().await;

        let prior = self.store.swap(&forward_key(identity), connection_id).await?;

        if let Err(e) = self.store.set(&reverse_key(connection_id), identity).await {
            self.restore_forward(identity, connection_id, prior.as_deref())
                .await;
            return Err(e.into());
        }

        if let Some(prior_id) = prior.as_deref().filter(|p| *p != connection_id) {
            if let Err(e) = self
                .store
                .del_if_eq(&reverse_key(prior_id), identity)
                .await
            {
                tracing::warn!(
                    user_identity = %identity,
                    prior_connection_id = %prior_id,
                    error = %e,
                    "Failed to drop superseded reverse key"
                );
            }
            tracing::debug!(
                user_identity = %identity,
                connection_id = %connection_id,
                prior_connection_id = %prior_id,
                "Registered over existing session"
            );
        } else {
            tracing::debug!(
                user_identity = %identity,
                connection_id = %connection_id,
                "Registered session"
            );
        }

        Ok(prior)
    }

    /// Undo a half-written registration: the forward key goes back to
    /// `prior`, or away when there was none, as long as it still points at
    /// `connection_id`.
    async fn restore_forward(&self, identity: &str, connection_id: &str, prior: Option<&str>) {
        let fwd = forward_key(identity);
        let restored = match prior {
            Some(prior_id) if prior_id == connection_id => return,
            Some(prior_id) => self.store.set_if_eq(&fwd, connection_id, prior_id).await,
            None => self.store.del_if_eq(&fwd, connection_id).await,
        };
        if let Err(e) = restored {
            tracing::warn!(
                user_identity = %identity,
                connection_id = %connection_id,
                error = %e,
                "Failed to roll back forward key"
            );
        }
    }

    /// Drop the mapping for a closing connection.
    ///
    /// The reverse key is always removed. The forward key is removed only
    /// while it still points at `connection_id`; returns whether it was.
    pub async fn unregister(
        &self,
        connection_id: &str,
        expected_identity: &str,
    ) -> Result<bool, PresenceError> {
        let _guard = self.stripe(expected_identity).lock().await;

        self.store.del(&reverse_key(connection_id)).await?;
        let removed = self
            .store
            .del_if_eq(&forward_key(expected_identity), connection_id)
            .await?;

        tracing::debug!(
            user_identity = %expected_identity,
            connection_id = %connection_id,
            forward_removed = removed,
            "Unregistered session"
        );

        Ok(removed)
    }

    /// Current connection for `identity`, if any.
    pub async fn lookup(&self, identity: &str) -> Result<Option<ConnectionId>, PresenceError> {
        Ok(self.store.get(&forward_key(identity)).await?)
    }
}
