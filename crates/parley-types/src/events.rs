use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ConnectionId, Identity, Message, MessageContent, MessageKind, MessageStatus};

/// Events pushed from the server to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    /// Authentication succeeded; the connection is active. `online` lists
    /// everyone else already connected.
    Ready {
        connection_id: ConnectionId,
        user_id: Uuid,
        username: String,
        online: Vec<Identity>,
    },

    /// Reply to exactly one client frame.
    Ack(Ack),

    /// A user came online or went offline
    PresenceChanged {
        user_id: Uuid,
        username: String,
        online: bool,
    },

    /// A message was persisted and is being delivered live
    MessageDelivered {
        conversation_id: Uuid,
        message: Message,
    },

    /// Someone read a message this connection's user sent
    MessageRead {
        conversation_id: Uuid,
        message_id: Uuid,
        reader_id: Uuid,
        read_at: DateTime<Utc>,
    },

    Typing {
        conversation_id: Uuid,
        user_id: Uuid,
        is_typing: bool,
    },

    RoomMembershipChanged {
        conversation_id: Uuid,
        user_id: Uuid,
        joined: bool,
    },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientCommand {
    /// Authenticate the connection
    Identify { token: String },

    SendDirect {
        recipient_id: Uuid,
        #[serde(default = "default_kind")]
        kind: MessageKind,
        content: MessageContent,
    },

    SendGroup {
        conversation_id: Uuid,
        #[serde(default = "default_kind")]
        kind: MessageKind,
        content: MessageContent,
    },

    JoinRoom { conversation_id: Uuid },

    LeaveRoom { conversation_id: Uuid },

    MarkRead { message_id: Uuid },

    TypingStart { conversation_id: Uuid },

    TypingStop { conversation_id: Uuid },
}

fn default_kind() -> MessageKind {
    MessageKind::Text
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identify { .. } => "identify",
            Self::SendDirect { .. } => "send_direct",
            Self::SendGroup { .. } => "send_group",
            Self::JoinRoom { .. } => "join_room",
            Self::LeaveRoom { .. } => "leave_room",
            Self::MarkRead { .. } => "mark_read",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
        }
    }
}

/// One inbound frame. `request_id` is echoed back on the matching `Ack`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(default)]
    pub request_id: Option<u64>,
    pub command: ClientCommand,
}

impl ClientFrame {
    pub fn new(command: ClientCommand) -> Self {
        Self {
            request_id: None,
            command,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub request_id: Option<u64>,
    pub outcome: AckOutcome,
}

impl Ack {
    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, AckOutcome::Ok { .. })
    }

    pub fn result(&self) -> Option<&AckResult> {
        match &self.outcome {
            AckOutcome::Ok { result } => Some(result),
            AckOutcome::Error { .. } => None,
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match &self.outcome {
            AckOutcome::Ok { .. } => None,
            AckOutcome::Error { code, .. } => Some(*code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AckOutcome {
    Ok { result: AckResult },
    Error { code: ErrorCode, message: String },
}

/// Resulting entity state carried by a successful acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AckResult {
    Authenticated { user_id: Uuid },
    MessageSent { message: Message },
    Joined { conversation_id: Uuid },
    Left { conversation_id: Uuid },
    Read {
        message_id: Uuid,
        status: MessageStatus,
        /// False when the reader was already in the read-set.
        newly_read: bool,
    },
    Typing { conversation_id: Uuid, is_typing: bool },
}

/// Stable failure reasons reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthFailure,
    NotAuthenticated,
    AlreadyAuthenticated,
    NotAMember,
    NotFound,
    Denied,
    InvalidIntent,
    StoreFailure,
    ConnectionClosed,
    BadFrame,
}
