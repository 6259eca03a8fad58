use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ThreadlineError;

/// Conversation identifier (a ULID string)
pub type ConversationId = String;

/// Message identifier (SQLite rowid)
pub type MessageId = i64;

/// Who may read or write a conversation besides its owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    /// Only the owner
    #[default]
    Private,
    /// Anyone may read, only the owner may write
    PublicRead,
    /// Anyone may read and write
    PublicWrite,
}

impl AccessLevel {
    /// Column representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::PublicRead => "public_read",
            Self::PublicWrite => "public_write",
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessLevel {
    type Err = ThreadlineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(Self::Private),
            "public_read" => Ok(Self::PublicRead),
            "public_write" => Ok(Self::PublicWrite),
            other => Err(ThreadlineError::Validation(format!(
                "unknown access level '{}'",
                other
            ))),
        }
    }
}

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Assistant,
}

impl Sender {
    /// Column representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl FromStr for Sender {
    type Err = ThreadlineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(ThreadlineError::Validation(format!(
                "unknown sender '{}'",
                other
            ))),
        }
    }
}

/// A stored conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Unique identifier
    pub id: ConversationId,
    /// Owning user
    pub user_id: String,
    /// Display title ("New Chat" until one is generated)
    pub title: String,
    /// Sharing level
    pub access_level: AccessLevel,
    /// When the conversation was created
    pub created_at: DateTime<Utc>,
    /// Touched whenever a message in it is finalized
    pub updated_at: DateTime<Utc>,
}

/// A stored message
///
/// `final_text` is empty while an assistant message is streaming; the text
/// produced so far lives in the chunk log until finalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique identifier
    pub id: MessageId,
    /// Parent conversation
    pub conversation_id: ConversationId,
    /// Author
    pub sender: Sender,
    /// Whether the text is terminal
    pub is_final: bool,
    /// Terminal text (empty while streaming)
    pub final_text: String,
    /// When the row was inserted
    pub created_at: DateTime<Utc>,
    /// When the row last changed
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// True for the non-final assistant message of a conversation
    pub fn is_in_flight(&self) -> bool {
        self.sender == Sender::Assistant && !self.is_final
    }
}

/// A recorded user turn and the assistant placeholder answering it
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    /// Conversation the turn belongs to
    pub conversation: Conversation,
    /// Final user message
    pub user_message: Message,
    /// Non-final assistant message the answer streams into
    pub placeholder: Message,
}

/// Persisted form of one generated fragment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    /// Unique identifier
    pub id: i64,
    /// Message the fragment belongs to
    pub message_id: MessageId,
    /// Position in the message's log, starting at 0
    pub chunk_index: i64,
    /// Fragment text
    pub content: String,
    /// When the fragment was persisted
    pub created_at: DateTime<Utc>,
}

/// Result of collapsing a message's chunk log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The message was non-final and is now final
    Finalized {
        /// Text written to `final_text`
        text: String,
        /// Number of chunk rows removed
        chunks_deleted: usize,
    },
    /// Another finalizer got there first; nothing changed
    AlreadyFinal,
}
