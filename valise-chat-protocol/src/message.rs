//! Chat message data model
//!
//! Messages are exchanged between exactly two operators. A message starts its
//! life locally as a *temporary* entry the instant the operator presses send,
//! and is replaced by the server-confirmed row once the persist call returns
//! or the matching push event arrives. Timestamps are UNIX epoch milliseconds;
//! temporaries carry the provisional client clock until confirmation.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Current time as UNIX epoch milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Message identifier
///
/// Server-assigned once confirmed; a locally generated uuid, tagged as
/// temporary, before confirmation. Temporary ids never cross the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// Server-assigned identifier of a persisted message
    Confirmed(String),
    /// Locally generated identifier of an unconfirmed optimistic entry
    Temporary(String),
}

impl MessageId {
    /// Generate a fresh temporary id
    pub fn temporary() -> Self {
        Self::Temporary(Uuid::new_v4().to_string())
    }

    /// Whether this id belongs to an unconfirmed optimistic entry
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// The raw id string
    pub fn as_str(&self) -> &str {
        match self {
            Self::Confirmed(id) | Self::Temporary(id) => id,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Confirmed(id) => write!(f, "{}", id),
            Self::Temporary(id) => write!(f, "temp:{}", id),
        }
    }
}

/// A chat message between two operators
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Message identifier (confirmed or temporary)
    pub id: MessageId,

    /// User id of the author
    pub sender_id: String,

    /// User id of the recipient
    pub receiver_id: String,

    /// Message text (non-empty, trimmed)
    pub content: String,

    /// Creation timestamp in epoch milliseconds; server-assigned on
    /// confirmation, provisional client clock while temporary
    pub created_at: i64,

    /// When the recipient read the message, if they have
    pub read_at: Option<i64>,
}

impl Message {
    /// Create a temporary outgoing message for optimistic display
    pub fn outgoing(sender_id: &str, receiver_id: &str, content: &str) -> Self {
        Self {
            id: MessageId::temporary(),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            content: content.to_string(),
            created_at: now_millis(),
            read_at: None,
        }
    }

    /// Whether this message is an unconfirmed optimistic entry
    pub fn is_temporary(&self) -> bool {
        self.id.is_temporary()
    }

    /// Whether the user is sender or receiver of this message
    pub fn involves(&self, user_id: &str) -> bool {
        self.sender_id == user_id || self.receiver_id == user_id
    }

    /// Whether this message belongs to the conversation between `a` and `b`,
    /// in either direction
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }

    /// The other party of the conversation, from `user_id`'s point of view
    ///
    /// Returns `None` if the user is not a participant.
    pub fn counterpart_of(&self, user_id: &str) -> Option<&str> {
        if self.sender_id == user_id {
            Some(&self.receiver_id)
        } else if self.receiver_id == user_id {
            Some(&self.sender_id)
        } else {
            None
        }
    }

    /// Whether this message is unread from `user_id`'s point of view
    pub fn is_unread_for(&self, user_id: &str) -> bool {
        self.receiver_id == user_id && self.read_at.is_none()
    }
}

/// Persisted message row as delivered by the store and push transports
///
/// The raw wire shape: ids are plain strings (always confirmed) and
/// timestamps are epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub created_at: i64,
    #[serde(default)]
    pub read_at: Option<i64>,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: MessageId::Confirmed(row.id),
            sender_id: row.sender_id,
            receiver_id: row.receiver_id,
            content: row.content,
            created_at: row.created_at,
            read_at: row.read_at,
        }
    }
}

/// Summary of one conversation for the counterpart list
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    /// The other party
    pub counterpart_id: String,

    /// Message with the newest created_at in the conversation
    pub last_message: Message,

    /// Messages addressed to us and not yet read
    pub unread_count: usize,
}
