use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use parley_types::models::{
    Conversation, ConversationKind, ConversationSummary, Message, MessageStatus, NewConversation,
    NewMessage, ReadReceipt, direct_key,
};

use crate::models::{ConversationRow, MessageRow, ReadRow, fmt_ts, now_micros, parse_ts, parse_uuid};
use crate::{Database, DbError, Result};

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, kind, body, attachment, status, seq, created_at";

impl Database {
    // -- Conversations --

    pub fn find_direct_conversation(&self, a: Uuid, b: Uuid) -> Result<Option<Conversation>> {
        let key = direct_key(a, b);
        self.with_conn(|conn| {
            let id: Option<String> = conn
                .query_row(
                    "SELECT id FROM conversations WHERE direct_key = ?1",
                    [&key],
                    |row| row.get(0),
                )
                .optional()?;

            match id {
                Some(id) => load_conversation(conn, &id),
                None => Ok(None),
            }
        })
    }

    /// Insert a conversation and its participants in one transaction.
    /// A second direct conversation for the same pair fails with
    /// `DbError::Conflict` via the unique `direct_key`.
    pub fn create_conversation(&self, new: &NewConversation) -> Result<Conversation> {
        let id = Uuid::new_v4();
        let now = now_micros();

        let (kind, name, owner_id, key, participants) = match new {
            NewConversation::Direct { a, b } => {
                if a == b {
                    return Err(DbError::Invalid(
                        "direct conversation needs two distinct participants".into(),
                    ));
                }
                (ConversationKind::Direct, None, None, Some(direct_key(*a, *b)), vec![*a, *b])
            }
            NewConversation::Group {
                owner_id,
                name,
                participants,
            } => {
                let mut members = vec![*owner_id];
                for p in participants {
                    if !members.contains(p) {
                        members.push(*p);
                    }
                }
                if members.len() < 2 {
                    return Err(DbError::Invalid("group needs at least two participants".into()));
                }
                (ConversationKind::Group, Some(name.clone()), Some(*owner_id), None, members)
            }
        };

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO conversations (id, kind, name, owner_id, direct_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    kind.as_str(),
                    name,
                    owner_id.map(|o| o.to_string()),
                    key,
                    fmt_ts(now)
                ],
            )?;
            for p in &participants {
                tx.execute(
                    "INSERT INTO conversation_participants (conversation_id, user_id, joined_at)
                     VALUES (?1, ?2, ?3)",
                    params![id.to_string(), p.to_string(), fmt_ts(now)],
                )?;
            }
            tx.commit()?;
            Ok(())
        })?;

        Ok(Conversation {
            id,
            kind,
            name,
            owner_id,
            participants,
            last_message: None,
            created_at: now,
        })
    }

    pub fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        self.with_conn(|conn| load_conversation(conn, &id.to_string()))
    }

    /// Conversations `user_id` participates in, most recently active first.
    pub fn list_conversations(&self, user_id: Uuid) -> Result<Vec<Conversation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id FROM conversations c
                 JOIN conversation_participants p ON p.conversation_id = c.id
                 WHERE p.user_id = ?1
                 ORDER BY COALESCE(c.last_at, c.created_at) DESC",
            )?;
            let ids = stmt
                .query_map([user_id.to_string()], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut conversations = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(c) = load_conversation(conn, &id)? {
                    conversations.push(c);
                }
            }
            Ok(conversations)
        })
    }

    pub fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let found: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM conversation_participants
                               WHERE conversation_id = ?1 AND user_id = ?2)",
                params![conversation_id.to_string(), user_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(found)
        })
    }

    /// Add a member to a group. Returns false if they were already in it.
    pub fn add_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let (kind, _) = conversation_kind_and_owner(conn, conversation_id)?;
            if kind != ConversationKind::Group {
                return Err(DbError::Invalid("direct conversations have fixed participants".into()));
            }
            let changed = conn.execute(
                "INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id, joined_at)
                 VALUES (?1, ?2, ?3)",
                params![conversation_id.to_string(), user_id.to_string(), fmt_ts(now_micros())],
            )?;
            Ok(changed > 0)
        })
    }

    /// Remove a member from a group. The owner cannot be removed.
    pub fn remove_participant(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let (kind, owner) = conversation_kind_and_owner(conn, conversation_id)?;
            if kind != ConversationKind::Group {
                return Err(DbError::Invalid("direct conversations have fixed participants".into()));
            }
            if owner == Some(user_id) {
                return Err(DbError::Invalid("the group owner cannot be removed".into()));
            }
            let changed = conn.execute(
                "DELETE FROM conversation_participants WHERE conversation_id = ?1 AND user_id = ?2",
                params![conversation_id.to_string(), user_id.to_string()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Overwrite the last-message summary unless a newer one is already
    /// recorded.
    pub fn update_conversation_summary(
        &self,
        conversation_id: Uuid,
        summary: &ConversationSummary,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let at = fmt_ts(summary.sent_at);
            let changed = conn.execute(
                "UPDATE conversations
                 SET last_preview = ?2, last_sender_id = ?3, last_kind = ?4, last_at = ?5
                 WHERE id = ?1 AND (last_at IS NULL OR last_at <= ?5)",
                params![
                    conversation_id.to_string(),
                    summary.preview,
                    summary.sender_id.to_string(),
                    summary.kind.as_str(),
                    at
                ],
            )?;
            if changed == 0 {
                conversation_kind_and_owner(conn, conversation_id)?;
            }
            Ok(())
        })
    }

    // -- Messages --

    /// Append a message, assigning its id, its position and a creation
    /// timestamp strictly later than the previous message in the same
    /// conversation.
    pub fn append_message(&self, new: &NewMessage) -> Result<Message> {
        let id = Uuid::new_v4();
        let cid = new.conversation_id.to_string();
        let attachment = new
            .content
            .attachment
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DbError::Invalid(format!("attachment: {}", e)))?;

        let (seq, created_at) = self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM conversations WHERE id = ?1)",
                [&cid],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(DbError::NotFound(format!("conversation {}", cid)));
            }

            let last: Option<(i64, String)> = tx
                .query_row(
                    "SELECT seq, created_at FROM messages
                     WHERE conversation_id = ?1 ORDER BY seq DESC LIMIT 1",
                    [&cid],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let mut created_at = now_micros();
            let seq = match last {
                Some((last_seq, last_at)) => {
                    let last_at = parse_ts(&last_at)?;
                    if created_at <= last_at {
                        created_at = last_at + Duration::microseconds(1);
                    }
                    last_seq + 1
                }
                None => 1,
            };

            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, kind, body, attachment, status, seq, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id.to_string(),
                    cid,
                    new.sender_id.to_string(),
                    new.kind.as_str(),
                    new.content.text,
                    attachment,
                    MessageStatus::Sent.rank(),
                    seq,
                    fmt_ts(created_at)
                ],
            )?;
            tx.commit()?;
            Ok((seq, created_at))
        })?;

        Ok(Message {
            id,
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            kind: new.kind,
            content: new.content.clone(),
            status: MessageStatus::Sent,
            seq,
            created_at,
            read_by: vec![],
        })
    }

    pub fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
                    [id.to_string()],
                    message_row,
                )
                .optional()?;

            let Some(row) = row else {
                return Ok(None);
            };
            let reads = query_reads(conn, std::slice::from_ref(&row.id))?;
            let receipts = reads
                .into_iter()
                .map(ReadRow::into_receipt)
                .collect::<Result<Vec<_>>>()?;
            row.into_message(receipts).map(Some)
        })
    }

    /// A page of messages, newest first. `before` is an exclusive
    /// `created_at` cursor.
    pub fn list_messages(
        &self,
        conversation_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages
                 WHERE conversation_id = ?1 AND (?2 IS NULL OR created_at < ?2)
                 ORDER BY seq DESC
                 LIMIT ?3",
                MESSAGE_COLUMNS
            ))?;
            let rows = stmt
                .query_map(
                    params![conversation_id.to_string(), before.map(fmt_ts), limit],
                    message_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
            let mut reads_by_message: std::collections::HashMap<String, Vec<ReadReceipt>> =
                std::collections::HashMap::new();
            for r in query_reads(conn, &ids)? {
                let message_id = r.message_id.clone();
                reads_by_message
                    .entry(message_id)
                    .or_default()
                    .push(r.into_receipt()?);
            }

            rows.into_iter()
                .map(|row| {
                    let receipts = reads_by_message.remove(&row.id).unwrap_or_default();
                    row.into_message(receipts)
                })
                .collect()
        })
    }

    /// Advance a message's status. Never moves backwards: returns false when
    /// the stored status is already at or past `status`.
    pub fn update_message_status(&self, id: Uuid, status: MessageStatus) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET status = ?2 WHERE id = ?1 AND status < ?2",
                params![id.to_string(), status.rank()],
            )?;
            if changed == 0 {
                ensure_message(conn, id)?;
            }
            Ok(changed > 0)
        })
    }

    /// Record that `user_id` read the message. Returns false if they already
    /// had; the first read time is kept.
    pub fn append_reader(&self, id: Uuid, user_id: Uuid, read_at: DateTime<Utc>) -> Result<bool> {
        self.with_conn_mut(|conn| {
            ensure_message(conn, id)?;
            let changed = conn.execute(
                "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at) VALUES (?1, ?2, ?3)",
                params![id.to_string(), user_id.to_string(), fmt_ts(read_at)],
            )?;
            Ok(changed > 0)
        })
    }

    /// Mark every still-`Sent` message addressed to `recipient_id` in a
    /// direct conversation as delivered. Returns how many advanced.
    pub fn deliver_pending(&self, conversation_id: Uuid, recipient_id: Uuid) -> Result<usize> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET status = ?3
                 WHERE conversation_id = ?1 AND sender_id != ?2 AND status < ?3
                   AND conversation_id IN (SELECT id FROM conversations WHERE kind = 'direct')",
                params![
                    conversation_id.to_string(),
                    recipient_id.to_string(),
                    MessageStatus::Delivered.rank()
                ],
            )?;
            Ok(changed)
        })
    }
}

fn load_conversation(conn: &Connection, id: &str) -> Result<Option<Conversation>> {
    let row = conn
        .query_row(
            "SELECT id, kind, name, owner_id, last_preview, last_sender_id, last_kind, last_at, created_at
             FROM conversations WHERE id = ?1",
            [id],
            |row| {
                Ok(ConversationRow {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    name: row.get(2)?,
                    owner_id: row.get(3)?,
                    last_preview: row.get(4)?,
                    last_sender_id: row.get(5)?,
                    last_kind: row.get(6)?,
                    last_at: row.get(7)?,
                    created_at: row.get(8)?,
                })
            },
        )
        .optional()?;

    let Some(row) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT user_id FROM conversation_participants WHERE conversation_id = ?1 ORDER BY rowid",
    )?;
    let participants = stmt
        .query_map([id], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?
        .iter()
        .map(|p| parse_uuid(p))
        .collect::<Result<Vec<_>>>()?;

    row.into_conversation(participants).map(Some)
}

fn conversation_kind_and_owner(
    conn: &Connection,
    id: Uuid,
) -> Result<(ConversationKind, Option<Uuid>)> {
    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT kind, owner_id FROM conversations WHERE id = ?1",
            [id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let (kind, owner) = row.ok_or_else(|| DbError::NotFound(format!("conversation {}", id)))?;
    let kind = ConversationKind::parse(&kind)
        .ok_or_else(|| DbError::Corrupt(format!("conversation kind '{}'", kind)))?;
    Ok((kind, owner.as_deref().map(parse_uuid).transpose()?))
}

fn ensure_message(conn: &Connection, id: Uuid) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?1)",
        [id.to_string()],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(DbError::NotFound(format!("message {}", id)))
    }
}

fn message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        kind: row.get(3)?,
        body: row.get(4)?,
        attachment: row.get(5)?,
        status: row.get(6)?,
        seq: row.get(7)?,
        created_at: row.get(8)?,
    })
}

/// Batch-fetch read receipts for a set of message IDs.
fn query_reads(conn: &Connection, message_ids: &[String]) -> Result<Vec<ReadRow>> {
    if message_ids.is_empty() {
        return Ok(vec![]);
    }

    let placeholders: Vec<String> = (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "SELECT message_id, user_id, read_at FROM message_reads
         WHERE message_id IN ({}) ORDER BY read_at",
        placeholders.join(", ")
    );

    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
        .iter()
        .map(|id| id as &dyn rusqlite::types::ToSql)
        .collect();

    let rows = stmt
        .query_map(params.as_slice(), |row| {
            Ok(ReadRow {
                message_id: row.get(0)?,
                user_id: row.get(1)?,
                read_at: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}
