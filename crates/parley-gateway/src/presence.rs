use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use parley_types::api::OnlineUser;
use parley_types::models::{ConnectionId, Identity};

#[derive(Debug, Clone)]
struct PresenceEntry {
    identity: Identity,
    /// `None` once the identity went offline; the entry is kept for `last_seen`.
    connection: Option<ConnectionId>,
    online_since: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

/// Authoritative map of online identities to their single live connection.
/// All mutation goes through `register` / `unregister`.
#[derive(Clone, Default)]
pub struct PresenceRegistry {
    entries: Arc<RwLock<HashMap<Uuid, PresenceEntry>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `identity` as online on `conn_id`. Returns the connection it
    /// replaced, if the identity was already online elsewhere.
    pub async fn register(&self, identity: &Identity, conn_id: ConnectionId) -> Option<ConnectionId> {
        let now = Utc::now();
        let previous = self.entries.write().await.insert(
            identity.user_id,
            PresenceEntry {
                identity: identity.clone(),
                connection: Some(conn_id),
                online_since: now,
                last_seen: now,
            },
        );
        previous
            .and_then(|entry| entry.connection)
            .filter(|prev| *prev != conn_id)
    }

    /// Mark the identity offline, but only if `conn_id` is still the one on
    /// record. A stale disconnect after a reconnect leaves the newer
    /// connection in place. Returns whether anything changed.
    pub async fn unregister(&self, user_id: Uuid, conn_id: ConnectionId) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&user_id) {
            Some(entry) if entry.connection == Some(conn_id) => {
                entry.connection = None;
                entry.last_seen = Utc::now();
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, user_id: Uuid) -> Option<ConnectionId> {
        self.entries
            .read()
            .await
            .get(&user_id)
            .and_then(|entry| entry.connection)
    }

    /// Everyone currently online.
    pub async fn snapshot(&self) -> Vec<Identity> {
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.connection.is_some())
            .map(|entry| entry.identity.clone())
            .collect()
    }

    pub async fn online_users(&self) -> Vec<OnlineUser> {
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| entry.connection.is_some())
            .map(|entry| OnlineUser {
                user_id: entry.identity.user_id,
                username: entry.identity.username.clone(),
                since: entry.online_since,
            })
            .collect()
    }

    /// When the identity last connected or disconnected.
    pub async fn last_seen(&self, user_id: Uuid) -> Option<DateTime<Utc>> {
        self.entries.read().await.get(&user_id).map(|entry| entry.last_seen)
    }
}
