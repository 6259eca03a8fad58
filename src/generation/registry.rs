//! Stream registry
//!
//! Maps the id of every message currently being generated to the
//! cancellation token of its generation. One registry is constructed per
//! process and shared by the orchestrator, the stop entry point and the
//! recovery sweep.

use crate::error::{Result, ThreadlineError};
use crate::storage::MessageId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Process-wide map from message id to cancellation token
#[derive(Debug, Clone, Default)]
pub struct StreamRegistry {
    streams: Arc<Mutex<HashMap<MessageId, CancellationToken>>>,
}

impl StreamRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<MessageId, CancellationToken>> {
        // The map stays consistent even if a holder panicked mid-operation.
        self.streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a fresh token for `message_id`
    ///
    /// # Errors
    ///
    /// Returns `GenerationInProgress` if a token is already registered.
    ///
    /// # Examples
    ///
    /// ```
    /// use threadline::generation::StreamRegistry;
    ///
    /// let registry = StreamRegistry::new();
    /// let token = registry.register(7).unwrap();
    /// assert!(registry.register(7).is_err());
    /// assert!(registry.cancel(7));
    /// assert!(token.is_cancelled());
    /// ```
    pub fn register(&self, message_id: MessageId) -> Result<CancellationToken> {
        let mut streams = self.lock();
        if streams.contains_key(&message_id) {
            return Err(ThreadlineError::GenerationInProgress(format!(
                "message {} already has an active stream",
                message_id
            ))
            .into());
        }
        let token = CancellationToken::new();
        streams.insert(message_id, token.clone());
        tracing::debug!(message_id, "Registered stream");
        Ok(token)
    }

    /// Registers `message_id` and returns a guard that removes it on drop
    pub fn register_guarded(&self, message_id: MessageId) -> Result<ActiveStream> {
        let token = self.register(message_id)?;
        Ok(ActiveStream {
            registry: self.clone(),
            message_id,
            token,
        })
    }

    /// Signals cancellation; true iff a token existed
    pub fn cancel(&self, message_id: MessageId) -> bool {
        match self.lock().get(&message_id) {
            Some(token) => {
                token.cancel();
                tracing::debug!(message_id, "Cancelled stream");
                true
            }
            None => false,
        }
    }

    /// Signals every registered token; returns how many were signalled
    pub fn cancel_all(&self) -> usize {
        let streams = self.lock();
        for token in streams.values() {
            token.cancel();
        }
        streams.len()
    }

    /// Removes the entry for `message_id`, if any
    pub fn remove(&self, message_id: MessageId) {
        if self.lock().remove(&message_id).is_some() {
            tracing::debug!(message_id, "Removed stream");
        }
    }

    /// Whether `message_id` has a registered token
    pub fn contains(&self, message_id: MessageId) -> bool {
        self.lock().contains_key(&message_id)
    }

    /// Number of registered streams
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no stream is registered
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Registry entry tied to the lifetime of a generation task
///
/// Dropping the guard removes the entry, whatever way the task ended.
#[derive(Debug)]
pub struct ActiveStream {
    registry: StreamRegistry,
    message_id: MessageId,
    token: CancellationToken,
}

impl ActiveStream {
    /// Token the generation observes
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Message this stream writes to
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        self.registry.remove(self.message_id);
    }
}
