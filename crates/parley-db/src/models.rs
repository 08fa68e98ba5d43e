//! Database row types. These map directly to SQLite rows and are converted
//! into parley-types models at the query boundary, keeping the schema's
//! string encodings out of the rest of the workspace.

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use parley_types::models::{
    AttachmentRef, Conversation, ConversationKind, ConversationSummary, Message, MessageContent,
    MessageKind, MessageStatus, ReadReceipt,
};

use crate::{DbError, Result};

pub struct ConversationRow {
    pub id: String,
    pub kind: String,
    pub name: Option<String>,
    pub owner_id: Option<String>,
    pub last_preview: Option<String>,
    pub last_sender_id: Option<String>,
    pub last_kind: Option<String>,
    pub last_at: Option<String>,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub kind: String,
    pub body: Option<String>,
    pub attachment: Option<String>,
    pub status: i64,
    pub seq: i64,
    pub created_at: String,
}

pub struct ReadRow {
    pub message_id: String,
    pub user_id: String,
    pub read_at: String,
}

/// Timestamps are stored as fixed-width RFC 3339 with microseconds, so
/// lexicographic order in SQL matches chronological order.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DbError::Corrupt(format!("timestamp '{}': {}", raw, e)))
}

/// Current time truncated to the precision the store keeps.
pub fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

pub fn parse_uuid(raw: &str) -> Result<Uuid> {
    raw.parse()
        .map_err(|e| DbError::Corrupt(format!("uuid '{}': {}", raw, e)))
}

fn parse_kind(raw: &str) -> Result<MessageKind> {
    MessageKind::parse(raw).ok_or_else(|| DbError::Corrupt(format!("message kind '{}'", raw)))
}

impl ConversationRow {
    pub fn into_conversation(self, participants: Vec<Uuid>) -> Result<Conversation> {
        let kind = ConversationKind::parse(&self.kind)
            .ok_or_else(|| DbError::Corrupt(format!("conversation kind '{}'", self.kind)))?;

        let last_message = match (self.last_preview, self.last_sender_id, self.last_kind, self.last_at) {
            (Some(preview), Some(sender), Some(last_kind), Some(at)) => Some(ConversationSummary {
                preview,
                sender_id: parse_uuid(&sender)?,
                kind: parse_kind(&last_kind)?,
                sent_at: parse_ts(&at)?,
            }),
            _ => None,
        };

        Ok(Conversation {
            id: parse_uuid(&self.id)?,
            kind,
            name: self.name,
            owner_id: self.owner_id.as_deref().map(parse_uuid).transpose()?,
            participants,
            last_message,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

impl MessageRow {
    pub fn into_message(self, read_by: Vec<ReadReceipt>) -> Result<Message> {
        let attachment = self
            .attachment
            .as_deref()
            .map(serde_json::from_str::<AttachmentRef>)
            .transpose()
            .map_err(|e| DbError::Corrupt(format!("attachment on message '{}': {}", self.id, e)))?;

        Ok(Message {
            id: parse_uuid(&self.id)?,
            conversation_id: parse_uuid(&self.conversation_id)?,
            sender_id: parse_uuid(&self.sender_id)?,
            kind: parse_kind(&self.kind)?,
            content: MessageContent {
                text: self.body,
                attachment,
            },
            status: MessageStatus::from_rank(self.status)
                .ok_or_else(|| DbError::Corrupt(format!("status {} on message '{}'", self.status, self.id)))?,
            seq: self.seq,
            created_at: parse_ts(&self.created_at)?,
            read_by,
        })
    }
}

impl ReadRow {
    pub fn into_receipt(self) -> Result<ReadReceipt> {
        Ok(ReadReceipt {
            user_id: parse_uuid(&self.user_id)?,
            read_at: parse_ts(&self.read_at)?,
        })
    }
}
