use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use parley_types::events::ServerEvent;
use parley_types::models::{ConnectionId, Identity};

/// Lifecycle of one connection. `Closed` is terminal; a closed connection is
/// removed from the table, so it is only ever observed as the result of a
/// transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PushError {
    #[error("connection closed")]
    Closed,

    #[error("outbound queue full")]
    Overflow,
}

/// Sending half of a connection's bounded outbound queue, plus the token
/// that asks its transport to shut down.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<ServerEvent>,
    eviction: CancellationToken,
}

impl Outbound {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                eviction: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Never waits. A full queue evicts the connection (disconnect-on-overflow).
    pub fn push(&self, event: ServerEvent) -> Result<(), PushError> {
        if self.eviction.is_cancelled() {
            return Err(PushError::Closed);
        }
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.eviction.cancel();
                Err(PushError::Overflow)
            }
            Err(TrySendError::Closed(_)) => Err(PushError::Closed),
        }
    }

    pub fn evict(&self) {
        self.eviction.cancel();
    }

    pub fn eviction(&self) -> CancellationToken {
        self.eviction.clone()
    }
}

struct ConnectionSlot {
    state: ConnectionState,
    identity: Option<Identity>,
    outbound: Outbound,
}

/// What a connection looked like right before it was closed.
#[derive(Debug, Clone)]
pub struct ClosedConnection {
    pub previous: ConnectionState,
    pub identity: Option<Identity>,
}

/// Table of live connections and their outbound queues. Every push to a
/// connection goes through here.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    connections: RwLock<HashMap<ConnectionId, ConnectionSlot>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Track a freshly accepted connection in `Connecting`.
    pub async fn insert(&self, conn_id: ConnectionId, outbound: Outbound) {
        self.inner.connections.write().await.insert(
            conn_id,
            ConnectionSlot {
                state: ConnectionState::Connecting,
                identity: None,
                outbound,
            },
        );
    }

    pub async fn state(&self, conn_id: ConnectionId) -> Option<ConnectionState> {
        self.inner
            .connections
            .read()
            .await
            .get(&conn_id)
            .map(|slot| slot.state)
    }

    /// Move `from -> to` only if the connection is currently in `from`.
    pub async fn transition(
        &self,
        conn_id: ConnectionId,
        from: ConnectionState,
        to: ConnectionState,
    ) -> bool {
        let mut connections = self.inner.connections.write().await;
        match connections.get_mut(&conn_id) {
            Some(slot) if slot.state == from => {
                slot.state = to;
                true
            }
            _ => false,
        }
    }

    /// `Authenticating -> Active`, attaching the verified identity.
    /// Fails if the connection closed while the credential was being checked.
    pub async fn activate(&self, conn_id: ConnectionId, identity: Identity) -> bool {
        let mut connections = self.inner.connections.write().await;
        match connections.get_mut(&conn_id) {
            Some(slot) if slot.state == ConnectionState::Authenticating => {
                slot.state = ConnectionState::Active;
                slot.identity = Some(identity);
                true
            }
            _ => false,
        }
    }

    /// Identity of an `Active` connection.
    pub async fn identity(&self, conn_id: ConnectionId) -> Option<Identity> {
        let connections = self.inner.connections.read().await;
        connections
            .get(&conn_id)
            .filter(|slot| slot.state == ConnectionState::Active)
            .and_then(|slot| slot.identity.clone())
    }

    /// Remove the connection. Returns `None` if it was already gone, which
    /// makes repeated closes no-ops.
    pub async fn close(&self, conn_id: ConnectionId) -> Option<ClosedConnection> {
        let slot = self.inner.connections.write().await.remove(&conn_id)?;
        slot.outbound.evict();
        Some(ClosedConnection {
            previous: slot.state,
            identity: slot.identity,
        })
    }

    /// Ask the connection's transport to shut down.
    pub async fn evict(&self, conn_id: ConnectionId) {
        if let Some(slot) = self.inner.connections.read().await.get(&conn_id) {
            slot.outbound.evict();
        }
    }

    /// Send a targeted event to one connection.
    pub async fn send_to(&self, conn_id: ConnectionId, event: ServerEvent) -> Result<(), PushError> {
        let outbound = {
            let connections = self.inner.connections.read().await;
            connections
                .get(&conn_id)
                .map(|slot| slot.outbound.clone())
                .ok_or(PushError::Closed)?
        };
        let result = outbound.push(event);
        if let Err(PushError::Overflow) = result {
            warn!("Outbound queue overflow on {}, evicting", conn_id);
        }
        result
    }

    /// Send to each listed connection, skipping `exclude`. Returns how many
    /// pushes were accepted; failures are dropped.
    pub async fn send_to_many(
        &self,
        targets: &[ConnectionId],
        event: &ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let mut delivered = 0;
        for &conn_id in targets {
            if Some(conn_id) == exclude {
                continue;
            }
            match self.send_to(conn_id, event.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Dropped push to {}: {}", conn_id, e),
            }
        }
        delivered
    }

    /// Broadcast an event to every active connection except `exclude`.
    pub async fn broadcast(&self, event: ServerEvent, exclude: Option<ConnectionId>) -> usize {
        let targets: Vec<(ConnectionId, Outbound)> = {
            let connections = self.inner.connections.read().await;
            connections
                .iter()
                .filter(|(id, slot)| slot.state == ConnectionState::Active && Some(**id) != exclude)
                .map(|(id, slot)| (*id, slot.outbound.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (conn_id, outbound) in targets {
            match outbound.push(event.clone()) {
                Ok(()) => delivered += 1,
                Err(PushError::Overflow) => warn!("Outbound queue overflow on {}, evicting", conn_id),
                Err(PushError::Closed) => {}
            }
        }
        delivered
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
