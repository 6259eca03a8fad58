//! Conversation permission checks
//!
//! The store and the stop entry point consult an [`AccessPolicy`] rather than
//! hard-coding who may touch a conversation.

use crate::storage::types::{AccessLevel, Conversation};

/// Decides whether a requester may read or write a conversation
pub trait AccessPolicy: Send + Sync {
    /// True when `requester` may read the conversation's messages
    fn can_read(&self, conversation: &Conversation, requester: &str) -> bool;

    /// True when `requester` may add messages to or stop generations in the conversation
    fn can_write(&self, conversation: &Conversation, requester: &str) -> bool;
}

/// Owner always has full access; others follow the conversation's access level
///
/// # Examples
///
/// ```
/// use chrono::Utc;
/// use threadline::access::{AccessPolicy, OwnerOrSharedPolicy};
/// use threadline::storage::types::{AccessLevel, Conversation};
///
/// let conversation = Conversation {
///     id: "01HZX".into(),
///     user_id: "alice".into(),
///     title: "New Chat".into(),
///     access_level: AccessLevel::PublicRead,
///     created_at: Utc::now(),
///     updated_at: Utc::now(),
/// };
/// let policy = OwnerOrSharedPolicy;
/// assert!(policy.can_read(&conversation, "bob"));
/// assert!(!policy.can_write(&conversation, "bob"));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct OwnerOrSharedPolicy;

impl AccessPolicy for OwnerOrSharedPolicy {
    fn can_read(&self, conversation: &Conversation, requester: &str) -> bool {
        conversation.user_id == requester
            || matches!(
                conversation.access_level,
                AccessLevel::PublicRead | AccessLevel::PublicWrite
            )
    }

    fn can_write(&self, conversation: &Conversation, requester: &str) -> bool {
        conversation.user_id == requester || conversation.access_level == AccessLevel::PublicWrite
    }
}
