//! Live queries
//!
//! A [`QueryDescriptor`] names a piece of data; a [`QuerySource`] turns it
//! into a [`LiveQuery`] that yields a fresh [`QueryResult`] whenever the
//! data changes.

use crate::error::{Result, ThreadlineError};
use crate::storage::{ConversationId, MessageId, SqliteStorage, StoreChange};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// What data a live query follows
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum QueryDescriptor {
    /// One conversation row, `null` when missing
    #[serde(rename_all = "camelCase")]
    Conversation { id: ConversationId },
    /// Messages of a conversation ordered by creation
    #[serde(rename_all = "camelCase")]
    ConversationMessages { conversation_id: ConversationId },
    /// Chunks of a message ordered by index
    #[serde(rename_all = "camelCase")]
    MessageChunks { message_id: MessageId },
}

impl QueryDescriptor {
    /// Stable content-derived key: SHA-256 hex of the canonical JSON form
    ///
    /// # Examples
    ///
    /// ```
    /// use threadline::live::QueryDescriptor;
    ///
    /// let a = QueryDescriptor::MessageChunks { message_id: 3 };
    /// let b = QueryDescriptor::MessageChunks { message_id: 3 };
    /// assert_eq!(a.hash_key(), b.hash_key());
    /// assert_eq!(a.hash_key().len(), 64);
    /// ```
    pub fn hash_key(&self) -> String {
        // Field order is fixed by the type, so the JSON form is canonical.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        digest.iter().map(|byte| format!("{:02x}", byte)).collect()
    }

    /// Whether the result is a list rather than a single row
    pub fn is_plural(&self) -> bool {
        !matches!(self, Self::Conversation { .. })
    }

    /// Result data before anything has been loaded
    pub fn empty_data(&self) -> Value {
        if self.is_plural() {
            Value::Array(Vec::new())
        } else {
            Value::Null
        }
    }

    /// Whether `change` may alter this query's result
    pub fn is_affected_by(&self, change: &StoreChange) -> bool {
        match (self, change) {
            (Self::Conversation { id }, StoreChange::Conversation { conversation_id }) => {
                id == conversation_id
            }
            (
                Self::ConversationMessages { conversation_id },
                StoreChange::Messages {
                    conversation_id: changed,
                },
            ) => conversation_id == changed,
            (Self::MessageChunks { message_id }, StoreChange::Chunks { message_id: changed }) => {
                message_id == changed
            }
            _ => false,
        }
    }
}

/// Whether a result is known to reflect the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// Placeholder or not yet confirmed
    #[default]
    Unknown,
    /// Loaded from the store
    Complete,
}

/// Snapshot of a live query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Rows as JSON (`null`, an object or an array)
    pub data: Value,
    /// Completeness tag shared by every reader of the result
    pub status: ResultStatus,
}

impl QueryResult {
    /// Placeholder shown until the first load arrives
    pub fn pending(descriptor: &QueryDescriptor) -> Self {
        Self {
            data: descriptor.empty_data(),
            status: ResultStatus::Unknown,
        }
    }

    /// Result confirmed by a load
    pub fn complete(data: Value) -> Self {
        Self {
            data,
            status: ResultStatus::Complete,
        }
    }

    /// Whether the result has been confirmed
    pub fn is_complete(&self) -> bool {
        self.status == ResultStatus::Complete
    }

    /// Deserializes the data into a typed value
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone()).map_err(ThreadlineError::from)?)
    }
}

/// An open live query
///
/// Dropping it, or calling [`LiveQuery::close`], stops the producer.
#[derive(Debug)]
pub struct LiveQuery {
    updates: mpsc::UnboundedReceiver<QueryResult>,
    close: CancellationToken,
}

impl LiveQuery {
    /// Wraps an update channel and the token that stops its producer
    pub fn new(updates: mpsc::UnboundedReceiver<QueryResult>, close: CancellationToken) -> Self {
        Self { updates, close }
    }

    /// Next result; `None` once the query is closed
    pub async fn next(&mut self) -> Option<QueryResult> {
        self.updates.recv().await
    }

    /// Token that closes this query when cancelled
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    /// Stops the producer
    pub fn close(&self) {
        self.close.cancel();
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.close.cancel();
    }
}

/// Opens live queries
///
/// Implementations must return without waiting for data; results are
/// delivered through the [`LiveQuery`].
pub trait QuerySource: Send + Sync {
    /// Starts following `descriptor`
    fn materialize(&self, descriptor: &QueryDescriptor) -> Result<LiveQuery>;
}

/// Live queries over the SQLite store
///
/// Loads once, then reloads on matching change-feed events. Writers in
/// other processes do not publish to this process's feed; set a poll
/// interval to follow them too. Unchanged reloads are not re-sent.
#[derive(Debug, Clone)]
pub struct StoreQuerySource {
    storage: SqliteStorage,
    poll_interval: Option<Duration>,
}

impl StoreQuerySource {
    /// Follows in-process changes only
    pub fn new(storage: SqliteStorage) -> Self {
        Self {
            storage,
            poll_interval: None,
        }
    }

    /// Also reloads every `interval`
    pub fn with_polling(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Loads the current data for `descriptor`
    pub fn load(&self, descriptor: &QueryDescriptor) -> Result<QueryResult> {
        let data = match descriptor {
            QueryDescriptor::Conversation { id } => {
                serde_json::to_value(self.storage.get_conversation(id)?)?
            }
            QueryDescriptor::ConversationMessages { conversation_id } => {
                serde_json::to_value(self.storage.list_messages(conversation_id)?)?
            }
            QueryDescriptor::MessageChunks { message_id } => {
                serde_json::to_value(self.storage.list_chunks(*message_id)?)?
            }
        };
        Ok(QueryResult::complete(data))
    }
}

impl QuerySource for StoreQuerySource {
    fn materialize(&self, descriptor: &QueryDescriptor) -> Result<LiveQuery> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            ThreadlineError::Config("live queries need a running Tokio runtime".to_string())
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let close = CancellationToken::new();
        // Subscribe before the first load so no change slips in between.
        let changes = self.storage.subscribe();

        runtime.spawn(follow(
            self.clone(),
            descriptor.clone(),
            changes,
            tx,
            close.clone(),
        ));
        Ok(LiveQuery::new(rx, close))
    }
}

async fn follow(
    source: StoreQuerySource,
    descriptor: QueryDescriptor,
    mut changes: broadcast::Receiver<StoreChange>,
    tx: mpsc::UnboundedSender<QueryResult>,
    close: CancellationToken,
) {
    let mut ticker = source.poll_interval.map(tokio::time::interval);
    let mut last: Option<Value> = None;

    if !reload(&source, &descriptor, &tx, &mut last).await {
        return;
    }

    loop {
        tokio::select! {
            biased;
            _ = close.cancelled() => break,
            change = changes.recv() => match change {
                Ok(change) if descriptor.is_affected_by(&change) => {}
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Live query lagged behind the change feed");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = async {
                match ticker.as_mut() {
                    Some(ticker) => {
                        ticker.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }

        if !reload(&source, &descriptor, &tx, &mut last).await {
            break;
        }
    }
    tracing::trace!(?descriptor, "Live query closed");
}

/// Sends a fresh result when it differs from the last one; false once the
/// receiver is gone
async fn reload(
    source: &StoreQuerySource,
    descriptor: &QueryDescriptor,
    tx: &mpsc::UnboundedSender<QueryResult>,
    last: &mut Option<Value>,
) -> bool {
    let (loader, target) = (source.clone(), descriptor.clone());
    let loaded = source
        .storage
        .run_blocking(move |_| loader.load(&target))
        .await;
    match loaded {
        Ok(result) => {
            if last.as_ref() == Some(&result.data) {
                return !tx.is_closed();
            }
            *last = Some(result.data.clone());
            tx.send(result).is_ok()
        }
        Err(e) => {
            tracing::warn!(?descriptor, error = %e, "Failed to load live query");
            !tx.is_closed()
        }
    }
}
