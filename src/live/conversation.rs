//! Live conversation reader
//!
//! Follows a conversation through two shared views: its messages, and the
//! chunks of whichever assistant message is currently in flight. The chunk
//! view is swapped whenever the in-flight message changes.

use crate::error::Result;
use crate::live::query::{QueryDescriptor, ResultStatus};
use crate::live::reconstruct::{in_flight_message, reconstruct};
use crate::live::view_store::{ViewStore, ViewSubscription};
use crate::storage::{Chunk, ConversationId, Message, MessageId};

use serde::Serialize;
use std::time::Duration;

/// What a reader displays at one point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveSnapshot {
    /// Messages with the in-flight text filled in from its chunks
    pub messages: Vec<Message>,
    /// Whether the last message is still being generated
    pub is_streaming: bool,
    /// `Complete` once both underlying views have loaded
    pub status: ResultStatus,
}

impl LiveSnapshot {
    /// The last message, if any
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// Reader of one conversation's live display list
#[derive(Debug)]
pub struct LiveConversation {
    views: ViewStore,
    scope: String,
    ttl: Duration,
    conversation_id: ConversationId,
    messages: ViewSubscription,
    chunks: Option<(MessageId, ViewSubscription)>,
}

impl LiveConversation {
    /// Subscribes to the messages of `conversation_id` in `scope`
    pub fn open(views: &ViewStore, scope: &str, conversation_id: &str, ttl: Duration) -> Self {
        let descriptor = QueryDescriptor::ConversationMessages {
            conversation_id: conversation_id.to_string(),
        };
        let messages = views.get_view(scope, &descriptor, ttl).subscribe();
        Self {
            views: views.clone(),
            scope: scope.to_string(),
            ttl,
            conversation_id: conversation_id.to_string(),
            messages,
            chunks: None,
        }
    }

    /// Conversation being followed
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Message whose chunks are currently followed
    pub fn streaming_message_id(&self) -> Option<MessageId> {
        self.chunks.as_ref().map(|(id, _)| *id)
    }

    /// Reconstructs the display list from the current view values
    pub fn snapshot(&mut self) -> Result<LiveSnapshot> {
        let result = self.messages.current();
        let messages: Vec<Message> = if result.data.is_null() {
            Vec::new()
        } else {
            result.decode()?
        };

        let in_flight = in_flight_message(&messages).map(|m| m.id);
        self.follow_chunks(in_flight);

        let (chunks, chunks_complete) = match &self.chunks {
            Some((_, subscription)) => {
                let chunks = subscription.current();
                (chunks.decode::<Vec<Chunk>>()?, chunks.is_complete())
            }
            None => (Vec::new(), true),
        };

        let status = if result.is_complete() && chunks_complete {
            ResultStatus::Complete
        } else {
            ResultStatus::Unknown
        };

        Ok(LiveSnapshot {
            messages: reconstruct(&messages, &chunks),
            is_streaming: in_flight.is_some(),
            status,
        })
    }

    /// Waits for either view to change and returns the new snapshot
    pub async fn changed(&mut self) -> Result<LiveSnapshot> {
        let messages = &mut self.messages;
        let chunks = self.chunks.as_mut().map(|(_, subscription)| subscription);

        tokio::select! {
            _ = messages.changed() => {}
            _ = async {
                match chunks {
                    Some(subscription) => subscription.changed().await,
                    None => std::future::pending().await,
                }
            } => {}
        }

        self.snapshot()
    }

    fn follow_chunks(&mut self, in_flight: Option<MessageId>) {
        if self.streaming_message_id() == in_flight {
            return;
        }

        self.chunks = in_flight.map(|message_id| {
            tracing::debug!(
                conversation_id = %self.conversation_id,
                message_id,
                "Following chunks of in-flight message"
            );
            let descriptor = QueryDescriptor::MessageChunks { message_id };
            let subscription = self
                .views
                .get_view(&self.scope, &descriptor, self.ttl)
                .subscribe();
            (message_id, subscription)
        });
    }
}
