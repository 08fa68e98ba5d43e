//! Shared harness: a `Gateway` over an in-memory SQLite store, with a
//! verifier that accepts `"<uuid>:<username>"` tokens.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use parley_db::Database;
use parley_gateway::{
    AuthError, ConnectionHandle, DurableStore, Gateway, GatewayConfig, IdentityVerifier,
    SqliteStore, StoreError,
};
use parley_types::events::{Ack, ClientCommand, ClientFrame, ServerEvent};
use parley_types::models::{
    ConnectionId, Conversation, ConversationSummary, Identity, Message, MessageContent,
    MessageKind, MessageStatus, NewConversation, NewMessage,
};

pub fn token_for(identity: &Identity) -> String {
    format!("{}:{}", identity.user_id, identity.username)
}

pub struct TokenVerifier {
    delay: Option<Duration>,
}

#[async_trait]
impl IdentityVerifier for TokenVerifier {
    async fn verify(&self, credential: &str) -> Result<Identity, AuthError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if credential.is_empty() {
            return Err(AuthError::Missing);
        }
        let (id, name) = credential.split_once(':').ok_or(AuthError::Invalid)?;
        let user_id: Uuid = id.parse().map_err(|_| AuthError::Invalid)?;
        Ok(Identity::new(user_id, name))
    }
}

/// Delegates to SQLite but can be told to fail specific writes.
pub struct FaultyStore {
    pub inner: SqliteStore,
    pub fail_summary: AtomicBool,
    pub fail_append: AtomicBool,
    pub fail_status: AtomicBool,
}

impl FaultyStore {
    fn unavailable() -> StoreError {
        StoreError::Unavailable("injected failure".into())
    }
}

#[async_trait]
impl DurableStore for FaultyStore {
    async fn find_direct_conversation(&self, a: Uuid, b: Uuid) -> Result<Option<Conversation>, StoreError> {
        self.inner.find_direct_conversation(a, b).await
    }

    async fn create_conversation(&self, conversation: NewConversation) -> Result<Conversation, StoreError> {
        self.inner.create_conversation(conversation).await
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        self.inner.get_conversation(id).await
    }

    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<Conversation>, StoreError> {
        self.inner.list_conversations(user_id).await
    }

    async fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        self.inner.is_participant(conversation_id, user_id).await
    }

    async fn add_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        self.inner.add_participant(conversation_id, user_id).await
    }

    async fn remove_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        self.inner.remove_participant(conversation_id, user_id).await
    }

    async fn update_conversation_summary(
        &self,
        conversation_id: Uuid,
        summary: ConversationSummary,
    ) -> Result<(), StoreError> {
        if self.fail_summary.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.update_conversation_summary(conversation_id, summary).await
    }

    async fn append_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        if self.fail_append.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.append_message(message).await
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        self.inner.get_message(id).await
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        self.inner.list_messages(conversation_id, before, limit).await
    }

    async fn update_message_status(&self, id: Uuid, status: MessageStatus) -> Result<bool, StoreError> {
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.update_message_status(id, status).await
    }

    async fn append_reader(&self, id: Uuid, user_id: Uuid, read_at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.inner.append_reader(id, user_id, read_at).await
    }

    async fn deliver_pending(&self, conversation_id: Uuid, recipient_id: Uuid) -> Result<usize, StoreError> {
        self.inner.deliver_pending(conversation_id, recipient_id).await
    }
}

pub struct Harness {
    pub gateway: Gateway,
    pub store: SqliteStore,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(GatewayConfig::default())
    }

    pub fn with_config(config: GatewayConfig) -> Self {
        let store = SqliteStore::new(Database::open_in_memory().unwrap());
        let gateway = Gateway::new(
            Arc::new(store.clone()),
            Arc::new(TokenVerifier { delay: None }),
            config,
        );
        Self { gateway, store }
    }

    pub fn with_slow_verifier(delay: Duration, config: GatewayConfig) -> Self {
        let store = SqliteStore::new(Database::open_in_memory().unwrap());
        let gateway = Gateway::new(
            Arc::new(store.clone()),
            Arc::new(TokenVerifier { delay: Some(delay) }),
            config,
        );
        Self { gateway, store }
    }

    pub fn with_faulty_store() -> (Self, Arc<FaultyStore>) {
        let store = SqliteStore::new(Database::open_in_memory().unwrap());
        let faulty = Arc::new(FaultyStore {
            inner: store.clone(),
            fail_summary: AtomicBool::new(false),
            fail_append: AtomicBool::new(false),
            fail_status: AtomicBool::new(false),
        });
        let gateway = Gateway::new(
            faulty.clone(),
            Arc::new(TokenVerifier { delay: None }),
            GatewayConfig::default(),
        );
        (Self { gateway, store }, faulty)
    }

    /// Accept and authenticate a connection, discarding its Ready event.
    pub async fn connect(&self, identity: &Identity) -> Client {
        let handle = self.gateway.on_connect().await;
        self.gateway
            .on_credential(handle.id, &token_for(identity))
            .await
            .unwrap();
        let mut client = Client {
            identity: identity.clone(),
            handle,
        };
        client.drain();
        client
    }

    pub async fn send(&self, client: &Client, command: ClientCommand) -> Ack {
        self.gateway
            .on_client_intent(client.id(), ClientFrame::new(command))
            .await
    }

    pub async fn create_group(&self, owner: &Identity, members: &[&Identity]) -> Conversation {
        self.gateway
            .router()
            .create_group(owner, "team", members.iter().map(|m| m.user_id).collect())
            .await
            .unwrap()
    }
}

pub struct Client {
    pub identity: Identity,
    pub handle: ConnectionHandle,
}

impl Client {
    pub fn id(&self) -> ConnectionId {
        self.handle.id
    }

    /// Everything queued for this connection so far.
    pub fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.handle.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn delivered(&mut self) -> Vec<Message> {
        self.drain()
            .into_iter()
            .filter_map(|event| match event {
                ServerEvent::MessageDelivered { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }
}

pub fn user(name: &str) -> Identity {
    Identity::new(Uuid::new_v4(), name)
}

pub fn direct(to: &Identity, text: &str) -> ClientCommand {
    ClientCommand::SendDirect {
        recipient_id: to.user_id,
        kind: MessageKind::Text,
        content: MessageContent::text(text),
    }
}

pub fn group(conversation_id: Uuid, text: &str) -> ClientCommand {
    ClientCommand::SendGroup {
        conversation_id,
        kind: MessageKind::Text,
        content: MessageContent::text(text),
    }
}

pub fn sent_message(ack: &Ack) -> Message {
    match ack.result() {
        Some(parley_types::events::AckResult::MessageSent { message }) => message.clone(),
        other => panic!("expected MessageSent ack, got {:?}", other),
    }
}
