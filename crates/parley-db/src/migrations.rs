use rusqlite::Connection;
use tracing::info;

use crate::Result;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT PRIMARY KEY,
            kind            TEXT NOT NULL CHECK (kind IN ('direct', 'group')),
            name            TEXT,
            owner_id        TEXT,
            -- sorted participant pair for direct conversations, NULL for groups
            direct_key      TEXT UNIQUE,
            last_preview    TEXT,
            last_sender_id  TEXT,
            last_kind       TEXT,
            last_at         TEXT,
            created_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversation_participants (
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            user_id         TEXT NOT NULL,
            joined_at       TEXT NOT NULL,
            PRIMARY KEY (conversation_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_participants_user
            ON conversation_participants(user_id);

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            sender_id       TEXT NOT NULL,
            kind            TEXT NOT NULL,
            body            TEXT,
            attachment      TEXT,
            status          INTEGER NOT NULL DEFAULT 0,
            seq             INTEGER NOT NULL,
            created_at      TEXT NOT NULL,
            UNIQUE(conversation_id, seq)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);

        CREATE TABLE IF NOT EXISTS message_reads (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL,
            read_at     TEXT NOT NULL,
            UNIQUE(message_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_reads_message
            ON message_reads(message_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
