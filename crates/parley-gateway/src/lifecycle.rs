use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_types::api::OnlineUser;
use parley_types::events::{Ack, AckOutcome, AckResult, ClientCommand, ClientFrame, ServerEvent};
use parley_types::models::{ConnectionId, Identity};

use crate::auth::IdentityVerifier;
use crate::config::GatewayConfig;
use crate::dispatcher::{ConnectionState, Dispatcher, Outbound, PushError};
use crate::error::{AuthError, GatewayError};
use crate::presence::PresenceRegistry;
use crate::rooms::RoomMembership;
use crate::router::MessageRouter;
use crate::store::DurableStore;

/// Transport-side half of a connection: the events to write to the socket
/// and the token that fires when the gateway wants the socket closed.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub events: mpsc::Receiver<ServerEvent>,
    pub eviction: CancellationToken,
}

/// Drives each connection through `Connecting -> Authenticating -> Active ->
/// Closed` and wires presence, rooms and the router together.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    verifier: Arc<dyn IdentityVerifier>,
    dispatcher: Dispatcher,
    presence: PresenceRegistry,
    rooms: RoomMembership,
    router: MessageRouter,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(
        store: Arc<dyn DurableStore>,
        verifier: Arc<dyn IdentityVerifier>,
        config: GatewayConfig,
    ) -> Self {
        let dispatcher = Dispatcher::new();
        let presence = PresenceRegistry::new();
        let rooms = RoomMembership::new();
        let router = MessageRouter::new(
            store,
            presence.clone(),
            rooms.clone(),
            dispatcher.clone(),
            config.history_page_max,
        );

        Self {
            inner: Arc::new(GatewayInner {
                verifier,
                dispatcher,
                presence,
                rooms,
                router,
                config,
            }),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.inner.presence
    }

    pub fn rooms(&self) -> &RoomMembership {
        &self.inner.rooms
    }

    pub async fn online_users(&self) -> Vec<OnlineUser> {
        self.inner.presence.online_users().await
    }

    pub async fn state(&self, conn_id: ConnectionId) -> ConnectionState {
        self.inner
            .dispatcher
            .state(conn_id)
            .await
            .unwrap_or(ConnectionState::Closed)
    }

    /// A transport accepted a connection. Assigns a fresh id.
    pub async fn on_connect(&self) -> ConnectionHandle {
        let id = ConnectionId::new();
        let (outbound, events) = Outbound::channel(self.inner.config.outbound_capacity);
        let eviction = outbound.eviction();
        self.inner.dispatcher.insert(id, outbound).await;
        debug!("Connection {} accepted", id);

        ConnectionHandle {
            id,
            events,
            eviction,
        }
    }

    /// Verify the credential and activate the connection. On failure the
    /// connection is closed before any registry is touched.
    pub async fn on_credential(
        &self,
        conn_id: ConnectionId,
        credential: &str,
    ) -> Result<Identity, GatewayError> {
        let dispatcher = &self.inner.dispatcher;
        if !dispatcher
            .transition(conn_id, ConnectionState::Connecting, ConnectionState::Authenticating)
            .await
        {
            return Err(match dispatcher.state(conn_id).await {
                Some(ConnectionState::Active) => GatewayError::AlreadyAuthenticated,
                Some(ConnectionState::Authenticating) => {
                    GatewayError::InvalidIntent("authentication already in progress".into())
                }
                _ => GatewayError::ConnectionClosed,
            });
        }

        let verified = tokio::time::timeout(
            self.inner.config.handshake_timeout,
            self.inner.verifier.verify(credential),
        )
        .await
        .unwrap_or(Err(AuthError::Timeout));

        let identity = match verified {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Connection {} failed to authenticate: {}", conn_id, e);
                dispatcher.close(conn_id).await;
                return Err(GatewayError::Auth(e));
            }
        };

        if !dispatcher.activate(conn_id, identity.clone()).await {
            debug!("Connection {} closed during authentication", conn_id);
            return Err(GatewayError::ConnectionClosed);
        }

        let presence = &self.inner.presence;
        let replaced = presence.register(&identity, conn_id).await;
        if let Some(old) = replaced {
            info!(
                "{} ({}) reconnected on {}, evicting {}",
                identity.username, identity.user_id, conn_id, old
            );
            dispatcher.evict(old).await;
        }

        // The connection may have closed between activation and registration;
        // its teardown then found nothing to unregister.
        if dispatcher.state(conn_id).await != Some(ConnectionState::Active) {
            if presence.unregister(identity.user_id, conn_id).await && replaced.is_some() {
                self.inner.router.announce_presence(&identity, false, None).await;
            }
            return Err(GatewayError::ConnectionClosed);
        }

        info!("{} ({}) connected on {}", identity.username, identity.user_id, conn_id);

        // One event however many users are online, so a fresh queue never
        // overflows on the snapshot.
        let online = presence
            .snapshot()
            .await
            .into_iter()
            .filter(|other| other.user_id != identity.user_id)
            .collect();
        let ready = ServerEvent::Ready {
            connection_id: conn_id,
            user_id: identity.user_id,
            username: identity.username.clone(),
            online,
        };
        if let Err(e) = dispatcher.send_to(conn_id, ready).await {
            debug!("Ready for {} not queued: {}", conn_id, e);
        }

        if replaced.is_none() {
            self.inner.router.announce_presence(&identity, true, Some(conn_id)).await;
        }
        Ok(identity)
    }

    /// Handle one client frame and build its acknowledgment. Exactly one
    /// `Ack` per frame, success or failure.
    pub async fn on_client_intent(&self, conn_id: ConnectionId, frame: ClientFrame) -> Ack {
        let request_id = frame.request_id;
        let intent = frame.command.name();
        let outcome = match self.dispatch(conn_id, frame.command).await {
            Ok(result) => AckOutcome::Ok { result },
            Err(e) => {
                debug!("{} on {} rejected: {}", intent, conn_id, e);
                AckOutcome::Error {
                    code: e.code(),
                    message: e.to_string(),
                }
            }
        };
        Ack {
            request_id,
            outcome,
        }
    }

    /// Queue an acknowledgment on the connection's own outbound queue, behind
    /// any events the intent produced for it.
    pub async fn reply(&self, conn_id: ConnectionId, ack: Ack) -> Result<(), PushError> {
        self.inner
            .dispatcher
            .send_to(conn_id, ServerEvent::Ack(ack))
            .await
    }

    async fn dispatch(
        &self,
        conn_id: ConnectionId,
        command: ClientCommand,
    ) -> Result<AckResult, GatewayError> {
        if let ClientCommand::Identify { token } = command {
            let identity = self.on_credential(conn_id, &token).await?;
            return Ok(AckResult::Authenticated {
                user_id: identity.user_id,
            });
        }

        let identity = self
            .inner
            .dispatcher
            .identity(conn_id)
            .await
            .ok_or(GatewayError::NotAuthenticated)?;
        let router = &self.inner.router;

        match command {
            ClientCommand::Identify { .. } => Err(GatewayError::AlreadyAuthenticated),

            ClientCommand::SendDirect {
                recipient_id,
                kind,
                content,
            } => {
                let message = router.send_direct(&identity, recipient_id, kind, content).await?;
                Ok(AckResult::MessageSent { message })
            }

            ClientCommand::SendGroup {
                conversation_id,
                kind,
                content,
            } => {
                let message = router
                    .send_group(conn_id, &identity, conversation_id, kind, content)
                    .await?;
                Ok(AckResult::MessageSent { message })
            }

            ClientCommand::JoinRoom { conversation_id } => {
                router.join_room(conn_id, &identity, conversation_id).await?;
                Ok(AckResult::Joined { conversation_id })
            }

            ClientCommand::LeaveRoom { conversation_id } => {
                router.leave_room(conn_id, &identity, conversation_id).await;
                Ok(AckResult::Left { conversation_id })
            }

            ClientCommand::MarkRead { message_id } => {
                let outcome = router.mark_read(&identity, message_id).await?;
                Ok(AckResult::Read {
                    message_id,
                    status: outcome.status,
                    newly_read: outcome.newly_read,
                })
            }

            ClientCommand::TypingStart { conversation_id } => {
                router.typing(conn_id, &identity, conversation_id, true).await?;
                Ok(AckResult::Typing {
                    conversation_id,
                    is_typing: true,
                })
            }

            ClientCommand::TypingStop { conversation_id } => {
                router.typing(conn_id, &identity, conversation_id, false).await?;
                Ok(AckResult::Typing {
                    conversation_id,
                    is_typing: false,
                })
            }
        }
    }

    /// Tear down a connection: drop its room memberships, then unregister its
    /// presence, then announce it offline if it was the live connection.
    /// Safe to call more than once.
    pub async fn on_disconnect(&self, conn_id: ConnectionId) {
        let Some(closed) = self.inner.dispatcher.close(conn_id).await else {
            return;
        };

        let identity = match (closed.previous, closed.identity) {
            (ConnectionState::Active, Some(identity)) => identity,
            (previous, _) => {
                debug!("Connection {} closed while {:?}", conn_id, previous);
                return;
            }
        };

        let rooms = self.inner.rooms.drop_connection(conn_id).await;

        if self.inner.presence.unregister(identity.user_id, conn_id).await {
            self.inner.router.announce_presence(&identity, false, None).await;
        } else {
            debug!(
                "Stale disconnect of {} for {} ignored",
                conn_id, identity.user_id
            );
        }

        self.inner.router.rooms_abandoned(&identity, &rooms).await;

        info!(
            "{} ({}) disconnected from {}",
            identity.username, identity.user_id, conn_id
        );
    }
}
