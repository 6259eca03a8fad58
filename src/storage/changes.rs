//! In-process change feed
//!
//! Every committed store mutation publishes a [`StoreChange`] so live
//! readers re-query only when something they care about moved.

use tokio::sync::broadcast;

use super::types::{ConversationId, MessageId};

const CHANGE_FEED_CAPACITY: usize = 1024;

/// What part of the store changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// A message was inserted or finalized
    Messages { conversation_id: ConversationId },
    /// A chunk was appended, or a message's chunk log was cleared
    Chunks { message_id: MessageId },
    /// Conversation metadata (title, access level, timestamps) changed
    Conversation { conversation_id: ConversationId },
}

impl StoreChange {
    /// Conversation this change belongs to, when known
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::Messages { conversation_id } | Self::Conversation { conversation_id } => {
                Some(conversation_id)
            }
            Self::Chunks { .. } => None,
        }
    }
}

/// Broadcast fan-out of store changes
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<StoreChange>,
}

impl ChangeFeed {
    /// Create an empty feed
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self { sender }
    }

    /// Publish a change; having no listeners is not an error
    pub fn publish(&self, change: StoreChange) {
        tracing::trace!(?change, "Publishing store change");
        let _ = self.sender.send(change);
    }

    /// Start listening for changes published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.sender.subscribe()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_published_change() {
        let feed = ChangeFeed::new();
        let mut rx = feed.subscribe();
        feed.publish(StoreChange::Chunks { message_id: 3 });
        assert_eq!(rx.recv().await.unwrap(), StoreChange::Chunks { message_id: 3 });
    }

    #[test]
    fn test_publish_without_listeners_is_silent() {
        let feed = ChangeFeed::new();
        feed.publish(StoreChange::Messages {
            conversation_id: "c".into(),
        });
    }

    #[test]
    fn test_conversation_id_accessor() {
        let change = StoreChange::Conversation {
            conversation_id: "abc".into(),
        };
        assert_eq!(change.conversation_id(), Some("abc"));
        assert_eq!(StoreChange::Chunks { message_id: 1 }.conversation_id(), None);
    }
}
