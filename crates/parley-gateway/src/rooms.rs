use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use parley_types::models::ConnectionId;

/// Pure membership index of which connections listen to which group
/// conversation. Authorization happens before `join` is called.
#[derive(Clone, Default)]
pub struct RoomMembership {
    inner: Arc<RwLock<RoomIndex>>,
}

#[derive(Default)]
struct RoomIndex {
    by_room: HashMap<Uuid, HashSet<ConnectionId>>,
    /// Reverse index so dropping a connection touches only its own rooms.
    by_connection: HashMap<ConnectionId, HashSet<Uuid>>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the connection was already in the room.
    pub async fn join(&self, conn_id: ConnectionId, room_id: Uuid) -> bool {
        let mut index = self.inner.write().await;
        let added = index.by_room.entry(room_id).or_default().insert(conn_id);
        index.by_connection.entry(conn_id).or_default().insert(room_id);
        added
    }

    /// Idempotent. Returns whether a membership was removed.
    pub async fn leave(&self, conn_id: ConnectionId, room_id: Uuid) -> bool {
        let mut index = self.inner.write().await;
        let removed = remove_from(&mut index.by_room, room_id, &conn_id);
        remove_from(&mut index.by_connection, conn_id, &room_id);
        removed
    }

    pub async fn members_of(&self, room_id: Uuid) -> Vec<ConnectionId> {
        self.inner
            .read()
            .await
            .by_room
            .get(&room_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn is_member(&self, conn_id: ConnectionId, room_id: Uuid) -> bool {
        self.inner
            .read()
            .await
            .by_room
            .get(&room_id)
            .is_some_and(|members| members.contains(&conn_id))
    }

    pub async fn rooms_of(&self, conn_id: ConnectionId) -> Vec<Uuid> {
        self.inner
            .read()
            .await
            .by_connection
            .get(&conn_id)
            .map(|rooms| rooms.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Remove every membership of `conn_id` in one step. Returns the rooms it
    /// was in.
    pub async fn drop_connection(&self, conn_id: ConnectionId) -> Vec<Uuid> {
        let mut index = self.inner.write().await;
        let rooms = index.by_connection.remove(&conn_id).unwrap_or_default();
        for room_id in &rooms {
            remove_from(&mut index.by_room, *room_id, &conn_id);
        }
        rooms.into_iter().collect()
    }
}

fn remove_from<K, V>(map: &mut HashMap<K, HashSet<V>>, key: K, value: &V) -> bool
where
    K: std::hash::Hash + Eq,
    V: std::hash::Hash + Eq,
{
    let Some(set) = map.get_mut(&key) else {
        return false;
    };
    let removed = set.remove(value);
    if set.is_empty() {
        map.remove(&key);
    }
    removed
}
