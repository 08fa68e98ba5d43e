use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::error;
use uuid::Uuid;

use parley_db::Database;
use parley_types::models::{
    Conversation, ConversationSummary, Message, MessageStatus, NewConversation, NewMessage,
};

use crate::error::StoreError;

/// Durable message and conversation persistence. The router treats it as the
/// single source of truth for content; every call is a suspension point.
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    async fn find_direct_conversation(&self, a: Uuid, b: Uuid) -> Result<Option<Conversation>, StoreError>;

    /// Must fail with `StoreError::Conflict` when a direct conversation for
    /// the same pair already exists.
    async fn create_conversation(&self, conversation: NewConversation) -> Result<Conversation, StoreError>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError>;

    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<Conversation>, StoreError>;

    async fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool, StoreError>;

    async fn add_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool, StoreError>;

    async fn remove_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool, StoreError>;

    async fn update_conversation_summary(
        &self,
        conversation_id: Uuid,
        summary: ConversationSummary,
    ) -> Result<(), StoreError>;

    /// Assigns id, position and timestamp.
    async fn append_message(&self, message: NewMessage) -> Result<Message, StoreError>;

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, StoreError>;

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError>;

    /// Forward-only. Returns false if the status was already at or past `status`.
    async fn update_message_status(&self, id: Uuid, status: MessageStatus) -> Result<bool, StoreError>;

    /// Returns false if `user_id` was already in the read-set.
    async fn append_reader(&self, id: Uuid, user_id: Uuid, read_at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Advance `recipient_id`'s still-sent incoming direct messages to delivered.
    async fn deliver_pending(&self, conversation_id: Uuid, recipient_id: Uuid) -> Result<usize, StoreError>;
}

/// `DurableStore` over the SQLite database. Calls run on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Database>,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db: Arc::new(db) }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> parley_db::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                StoreError::Unavailable(e.to_string())
            })?
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn find_direct_conversation(&self, a: Uuid, b: Uuid) -> Result<Option<Conversation>, StoreError> {
        self.blocking(move |db| db.find_direct_conversation(a, b)).await
    }

    async fn create_conversation(&self, conversation: NewConversation) -> Result<Conversation, StoreError> {
        self.blocking(move |db| db.create_conversation(&conversation)).await
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>, StoreError> {
        self.blocking(move |db| db.get_conversation(id)).await
    }

    async fn list_conversations(&self, user_id: Uuid) -> Result<Vec<Conversation>, StoreError> {
        self.blocking(move |db| db.list_conversations(user_id)).await
    }

    async fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        self.blocking(move |db| db.is_participant(conversation_id, user_id)).await
    }

    async fn add_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        self.blocking(move |db| db.add_participant(conversation_id, user_id)).await
    }

    async fn remove_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool, StoreError> {
        self.blocking(move |db| db.remove_participant(conversation_id, user_id)).await
    }

    async fn update_conversation_summary(
        &self,
        conversation_id: Uuid,
        summary: ConversationSummary,
    ) -> Result<(), StoreError> {
        self.blocking(move |db| db.update_conversation_summary(conversation_id, &summary))
            .await
    }

    async fn append_message(&self, message: NewMessage) -> Result<Message, StoreError> {
        self.blocking(move |db| db.append_message(&message)).await
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        self.blocking(move |db| db.get_message(id)).await
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        self.blocking(move |db| db.list_messages(conversation_id, before, limit))
            .await
    }

    async fn update_message_status(&self, id: Uuid, status: MessageStatus) -> Result<bool, StoreError> {
        self.blocking(move |db| db.update_message_status(id, status)).await
    }

    async fn append_reader(&self, id: Uuid, user_id: Uuid, read_at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.blocking(move |db| db.append_reader(id, user_id, read_at)).await
    }

    async fn deliver_pending(&self, conversation_id: Uuid, recipient_id: Uuid) -> Result<usize, StoreError> {
        self.blocking(move |db| db.deliver_pending(conversation_id, recipient_id))
            .await
    }
}
