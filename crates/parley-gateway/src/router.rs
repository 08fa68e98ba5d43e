use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use parley_types::events::ServerEvent;
use parley_types::models::{
    ConnectionId, Conversation, ConversationKind, ConversationSummary, Identity, Message,
    MessageContent, MessageKind, MessageStatus, NewConversation, NewMessage,
};

use crate::dispatcher::Dispatcher;
use crate::error::{GatewayError, StoreError};
use crate::presence::PresenceRegistry;
use crate::rooms::RoomMembership;
use crate::store::DurableStore;

/// Longest group name accepted.
const MAX_GROUP_NAME: usize = 64;

/// Outcome of a read receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    pub status: MessageStatus,
    pub newly_read: bool,
}

/// Persists outbound messages, keeps conversation summaries current and
/// decides who receives what.
#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    store: Arc<dyn DurableStore>,
    presence: PresenceRegistry,
    rooms: RoomMembership,
    dispatcher: Dispatcher,
    locks: ConversationLocks,
    history_page_max: u32,
}

type LockMap = HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>;

/// One async mutex per conversation. Persist and fan-out for a conversation
/// run under its lock, so broadcast order equals commit order while
/// different conversations proceed in parallel. An entry lives only while
/// someone holds or waits on it.
#[derive(Default)]
struct ConversationLocks {
    locks: Arc<Mutex<LockMap>>,
}

impl ConversationLocks {
    async fn acquire(&self, conversation_id: Uuid) -> ConversationGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(conversation_id).or_default().clone()
        };
        ConversationGuard {
            guard: Some(lock.lock_owned().await),
            conversation_id,
            locks: self.locks.clone(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Held conversation lock. Dropping it removes the map entry when no other
/// task holds or waits on the same conversation.
struct ConversationGuard {
    guard: Option<OwnedMutexGuard<()>>,
    conversation_id: Uuid,
    locks: Arc<Mutex<LockMap>>,
}

impl Drop for ConversationGuard {
    fn drop(&mut self) {
        // Release first so our reference no longer counts.
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.conversation_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.conversation_id);
        }
    }
}

impl MessageRouter {
    pub fn new(
        store: Arc<dyn DurableStore>,
        presence: PresenceRegistry,
        rooms: RoomMembership,
        dispatcher: Dispatcher,
        history_page_max: u32,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                store,
                presence,
                rooms,
                dispatcher,
                locks: ConversationLocks::default(),
                history_page_max: history_page_max.max(1),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.inner.store
    }

    // -- Direct messages --

    /// Persist a direct message and push it to the recipient if they are
    /// online. The returned message carries the furthest status reached.
    pub async fn send_direct(
        &self,
        sender: &Identity,
        recipient_id: Uuid,
        kind: MessageKind,
        content: MessageContent,
    ) -> Result<Message, GatewayError> {
        if recipient_id == sender.user_id {
            return Err(GatewayError::InvalidIntent(
                "cannot send a direct message to yourself".into(),
            ));
        }
        validate_content(&content)?;

        let conversation = self.resolve_direct(sender.user_id, recipient_id).await?;
        let _guard = self.inner.locks.acquire(conversation.id).await;

        let mut message = self
            .inner
            .store
            .append_message(NewMessage {
                conversation_id: conversation.id,
                sender_id: sender.user_id,
                kind,
                content,
            })
            .await?;
        debug!(
            "{} ({}) -> direct {} in {} (seq {})",
            sender.username, sender.user_id, message.id, conversation.id, message.seq
        );

        self.update_summary(&message).await;

        let Some(conn_id) = self.inner.presence.lookup(recipient_id).await else {
            debug!("Recipient {} offline, {} stays sent", recipient_id, message.id);
            return Ok(message);
        };

        let mut delivered = message.clone();
        delivered.status = MessageStatus::Delivered;
        let event = ServerEvent::MessageDelivered {
            conversation_id: conversation.id,
            message: delivered,
        };
        if let Err(e) = self.inner.dispatcher.send_to(conn_id, event).await {
            debug!("Push of {} to {} failed ({}), stays sent", message.id, conn_id, e);
            return Ok(message);
        }

        match self
            .inner
            .store
            .update_message_status(message.id, MessageStatus::Delivered)
            .await
        {
            Ok(_) => message.status = MessageStatus::Delivered,
            Err(e) => warn!("Failed to mark {} delivered: {}", message.id, e),
        }
        Ok(message)
    }

    /// Find the direct conversation for the pair, creating it on first use.
    /// A concurrent first send that loses the create race re-finds the
    /// winner's conversation.
    async fn resolve_direct(&self, a: Uuid, b: Uuid) -> Result<Conversation, GatewayError> {
        let store = &self.inner.store;
        if let Some(conversation) = store.find_direct_conversation(a, b).await? {
            return Ok(conversation);
        }

        match store.create_conversation(NewConversation::Direct { a, b }).await {
            Ok(conversation) => {
                info!("Created direct conversation {} for {} / {}", conversation.id, a, b);
                Ok(conversation)
            }
            Err(StoreError::Conflict) => {
                debug!("Direct conversation for {} / {} created concurrently, re-finding", a, b);
                store.find_direct_conversation(a, b).await?.ok_or_else(|| {
                    GatewayError::Store(StoreError::Unavailable(
                        "direct conversation missing after create conflict".into(),
                    ))
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    // -- Group messages --

    /// Persist a group message and broadcast it to every connection in the
    /// room, the sender's own included.
    pub async fn send_group(
        &self,
        conn_id: ConnectionId,
        sender: &Identity,
        conversation_id: Uuid,
        kind: MessageKind,
        content: MessageContent,
    ) -> Result<Message, GatewayError> {
        validate_content(&content)?;
        if !self.inner.rooms.is_member(conn_id, conversation_id).await {
            return Err(GatewayError::NotAMember(conversation_id));
        }

        // Re-checked under the lock: a revoke may have landed in between.
        let _guard = self.inner.locks.acquire(conversation_id).await;
        if !self.inner.rooms.is_member(conn_id, conversation_id).await {
            return Err(GatewayError::NotAMember(conversation_id));
        }

        let message = self
            .inner
            .store
            .append_message(NewMessage {
                conversation_id,
                sender_id: sender.user_id,
                kind,
                content,
            })
            .await?;

        self.update_summary(&message).await;

        let members = self.inner.rooms.members_of(conversation_id).await;
        let event = ServerEvent::MessageDelivered {
            conversation_id,
            message: message.clone(),
        };
        let reached = self.inner.dispatcher.send_to_many(&members, &event, None).await;
        debug!(
            "{} ({}) -> group {} in {} reached {}/{} connections",
            sender.username,
            sender.user_id,
            message.id,
            conversation_id,
            reached,
            members.len()
        );
        Ok(message)
    }

    async fn update_summary(&self, message: &Message) {
        if let Err(e) = self
            .inner
            .store
            .update_conversation_summary(message.conversation_id, ConversationSummary::of(message))
            .await
        {
            warn!(
                "Failed to update summary of {} after {}: {}",
                message.conversation_id, message.id, e
            );
        }
    }

    // -- Rooms --

    /// Subscribe a connection to a group's live channel. The identity must
    /// be a participant of the conversation.
    pub async fn join_room(
        &self,
        conn_id: ConnectionId,
        identity: &Identity,
        conversation_id: Uuid,
    ) -> Result<(), GatewayError> {
        let conversation = self.conversation(conversation_id).await?;
        if conversation.kind != ConversationKind::Group {
            return Err(GatewayError::Denied("only group conversations have rooms".into()));
        }

        let _guard = self.inner.locks.acquire(conversation_id).await;
        if !self
            .inner
            .store
            .is_participant(conversation_id, identity.user_id)
            .await?
        {
            return Err(GatewayError::Denied(format!(
                "{} is not a participant of {}",
                identity.user_id, conversation_id
            )));
        }

        if self.inner.rooms.join(conn_id, conversation_id).await {
            info!("{} ({}) joined room {}", identity.username, identity.user_id, conversation_id);
            self.announce_membership(conversation_id, identity.user_id, true, None)
                .await;
        }
        Ok(())
    }

    /// Idempotent. Returns whether the connection was in the room.
    pub async fn leave_room(
        &self,
        conn_id: ConnectionId,
        identity: &Identity,
        conversation_id: Uuid,
    ) -> bool {
        if !self.inner.rooms.is_member(conn_id, conversation_id).await {
            return false;
        }
        let _guard = self.inner.locks.acquire(conversation_id).await;
        let left = self.inner.rooms.leave(conn_id, conversation_id).await;
        if left {
            info!("{} ({}) left room {}", identity.username, identity.user_id, conversation_id);
            self.announce_membership(conversation_id, identity.user_id, false, Some(conn_id))
                .await;
        }
        left
    }

    /// Tell the remaining members of each room that a closed connection's
    /// identity is gone from it.
    pub async fn rooms_abandoned(&self, identity: &Identity, rooms: &[Uuid]) {
        for &room_id in rooms {
            self.announce_membership(room_id, identity.user_id, false, None)
                .await;
        }
    }

    /// Send `RoomMembershipChanged` to the room, plus `extra` (a connection
    /// that just left and would otherwise miss it).
    async fn announce_membership(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        joined: bool,
        extra: Option<ConnectionId>,
    ) {
        let mut targets = self.inner.rooms.members_of(conversation_id).await;
        if let Some(conn_id) = extra {
            targets.push(conn_id);
        }
        let event = ServerEvent::RoomMembershipChanged {
            conversation_id,
            user_id,
            joined,
        };
        self.inner.dispatcher.send_to_many(&targets, &event, None).await;
    }

    // -- Read receipts --

    /// Add the reader to the message's read-set. A direct message read by
    /// its recipient advances to `Read`, and the sender is notified if online.
    /// Re-marking is a no-op and notifies no one.
    pub async fn mark_read(
        &self,
        reader: &Identity,
        message_id: Uuid,
    ) -> Result<ReadOutcome, GatewayError> {
        let conversation_id = self.message(message_id).await?.conversation_id;
        let _guard = self.inner.locks.acquire(conversation_id).await;

        let message = self.message(message_id).await?;
        let conversation = self.conversation(conversation_id).await?;
        if !conversation.has_participant(reader.user_id) {
            return Err(GatewayError::Denied(format!(
                "{} is not a participant of {}",
                reader.user_id, conversation_id
            )));
        }

        let unchanged = ReadOutcome {
            status: message.status,
            newly_read: false,
        };
        if message.has_reader(reader.user_id) {
            return Ok(unchanged);
        }

        let read_at = Utc::now();
        if !self
            .inner
            .store
            .append_reader(message_id, reader.user_id, read_at)
            .await?
        {
            return Ok(unchanged);
        }

        let is_sender = reader.user_id == message.sender_id;
        let mut status = message.status;
        if conversation.kind == ConversationKind::Direct && !is_sender {
            match self
                .inner
                .store
                .update_message_status(message_id, MessageStatus::Read)
                .await
            {
                Ok(_) => status = MessageStatus::Read,
                Err(e) => warn!("Failed to mark {} read: {}", message_id, e),
            }
        }

        if !is_sender {
            if let Some(conn_id) = self.inner.presence.lookup(message.sender_id).await {
                let event = ServerEvent::MessageRead {
                    conversation_id,
                    message_id,
                    reader_id: reader.user_id,
                    read_at,
                };
                if let Err(e) = self.inner.dispatcher.send_to(conn_id, event).await {
                    debug!("Read receipt for {} not pushed: {}", message_id, e);
                }
            }
        }

        Ok(ReadOutcome {
            status,
            newly_read: true,
        })
    }

    // -- Typing --

    /// Ephemeral: fan out to the room (group) or the counterpart (direct),
    /// never to the originator. Unreachable recipients are skipped.
    pub async fn typing(
        &self,
        conn_id: ConnectionId,
        identity: &Identity,
        conversation_id: Uuid,
        is_typing: bool,
    ) -> Result<(), GatewayError> {
        let event = ServerEvent::Typing {
            conversation_id,
            user_id: identity.user_id,
            is_typing,
        };

        if self.inner.rooms.is_member(conn_id, conversation_id).await {
            let members = self.inner.rooms.members_of(conversation_id).await;
            self.inner
                .dispatcher
                .send_to_many(&members, &event, Some(conn_id))
                .await;
            trace!("{} typing={} in room {}", identity.user_id, is_typing, conversation_id);
            return Ok(());
        }

        let conversation = self.conversation(conversation_id).await?;
        match conversation.kind {
            ConversationKind::Group => Err(GatewayError::NotAMember(conversation_id)),
            ConversationKind::Direct => {
                if !conversation.has_participant(identity.user_id) {
                    return Err(GatewayError::Denied(format!(
                        "{} is not a participant of {}",
                        identity.user_id, conversation_id
                    )));
                }
                if let Some(peer) = conversation.counterpart(identity.user_id) {
                    if let Some(peer_conn) = self.inner.presence.lookup(peer).await {
                        if let Err(e) = self.inner.dispatcher.send_to(peer_conn, event).await {
                            trace!("Typing to {} dropped: {}", peer_conn, e);
                        }
                    }
                }
                trace!("{} typing={} in direct {}", identity.user_id, is_typing, conversation_id);
                Ok(())
            }
        }
    }

    // -- Presence --

    /// Tell every active connection, other than `origin`, that `identity`
    /// came online or went offline.
    pub async fn announce_presence(
        &self,
        identity: &Identity,
        online: bool,
        origin: Option<ConnectionId>,
    ) {
        let event = ServerEvent::PresenceChanged {
            user_id: identity.user_id,
            username: identity.username.clone(),
            online,
        };
        let reached = self.inner.dispatcher.broadcast(event, origin).await;
        debug!(
            "Presence {} online={} sent to {} connections",
            identity.user_id, online, reached
        );
    }

    // -- Group management --

    pub async fn create_group(
        &self,
        owner: &Identity,
        name: &str,
        participants: Vec<Uuid>,
    ) -> Result<Conversation, GatewayError> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_GROUP_NAME {
            return Err(GatewayError::InvalidIntent(format!(
                "group name must be 1-{} characters",
                MAX_GROUP_NAME
            )));
        }

        let conversation = self
            .inner
            .store
            .create_conversation(NewConversation::Group {
                owner_id: owner.user_id,
                name: name.to_string(),
                participants,
            })
            .await?;
        info!(
            "{} ({}) created group {} with {} participants",
            owner.username,
            owner.user_id,
            conversation.id,
            conversation.participants.len()
        );
        Ok(conversation)
    }

    /// Owner-only. Returns false if the user was already a participant.
    pub async fn add_member(
        &self,
        actor: &Identity,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, GatewayError> {
        let conversation = self.conversation(conversation_id).await?;
        require_owner(&conversation, actor)?;
        Ok(self.inner.store.add_participant(conversation_id, user_id).await?)
    }

    /// The owner may remove anyone but themselves; any participant may remove
    /// themselves. A removed identity's live room subscription is revoked.
    pub async fn remove_member(
        &self,
        actor: &Identity,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, GatewayError> {
        let conversation = self.conversation(conversation_id).await?;
        if actor.user_id != user_id {
            require_owner(&conversation, actor)?;
        }

        let removed = self
            .inner
            .store
            .remove_participant(conversation_id, user_id)
            .await?;
        if removed {
            self.revoke_membership(conversation_id, user_id).await;
        }
        Ok(removed)
    }

    async fn revoke_membership(&self, conversation_id: Uuid, user_id: Uuid) {
        let _guard = self.inner.locks.acquire(conversation_id).await;
        let Some(conn_id) = self.inner.presence.lookup(user_id).await else {
            return;
        };
        if self.inner.rooms.leave(conn_id, conversation_id).await {
            info!("Revoked room {} for {} on {}", conversation_id, user_id, conn_id);
            self.announce_membership(conversation_id, user_id, false, Some(conn_id))
                .await;
        }
    }

    // -- Queries --

    pub async fn conversations(&self, identity: &Identity) -> Result<Vec<Conversation>, GatewayError> {
        Ok(self.inner.store.list_conversations(identity.user_id).await?)
    }

    /// A page of history, newest first. Fetching is what delivers direct
    /// messages that arrived while the reader was offline.
    pub async fn history(
        &self,
        identity: &Identity,
        conversation_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Message>, GatewayError> {
        let conversation = self.conversation(conversation_id).await?;
        if !conversation.has_participant(identity.user_id) {
            return Err(GatewayError::Denied(format!(
                "{} is not a participant of {}",
                identity.user_id, conversation_id
            )));
        }

        let limit = limit.clamp(1, self.inner.history_page_max);
        let mut messages = self
            .inner
            .store
            .list_messages(conversation_id, before, limit)
            .await?;

        if conversation.kind == ConversationKind::Direct {
            match self
                .inner
                .store
                .deliver_pending(conversation_id, identity.user_id)
                .await
            {
                Ok(0) => {}
                Ok(n) => {
                    debug!("Backlog fetch delivered {} messages to {}", n, identity.user_id);
                    for m in messages.iter_mut() {
                        if m.sender_id != identity.user_id && m.status == MessageStatus::Sent {
                            m.status = MessageStatus::Delivered;
                        }
                    }
                }
                Err(e) => warn!("Failed to mark backlog delivered in {}: {}", conversation_id, e),
            }
        }
        Ok(messages)
    }

    async fn conversation(&self, id: Uuid) -> Result<Conversation, GatewayError> {
        self.inner
            .store
            .get_conversation(id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("conversation {}", id)))
    }

    async fn message(&self, id: Uuid) -> Result<Message, GatewayError> {
        self.inner
            .store
            .get_message(id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(format!("message {}", id)))
    }
}

fn validate_content(content: &MessageContent) -> Result<(), GatewayError> {
    if content.is_empty() {
        return Err(GatewayError::InvalidIntent(
            "message needs text or an attachment".into(),
        ));
    }
    Ok(())
}

fn require_owner(conversation: &Conversation, actor: &Identity) -> Result<(), GatewayError> {
    if conversation.kind != ConversationKind::Group {
        return Err(GatewayError::Denied("direct conversations have fixed participants".into()));
    }
    if conversation.owner_id != Some(actor.user_id) {
        return Err(GatewayError::Denied("only the group owner can change membership".into()));
    }
    Ok(())
}
