//! Finalization
//!
//! Collapses a message's chunk log into its terminal text. Three call sites
//! use it: normal completion, cancellation and the recovery sweep. Any of
//! them may race; the store's conditional update picks one winner and the
//! others see [`FinalizeOutcome::AlreadyFinal`].

use crate::error::Result;
use crate::generation::metrics::record_finalization;
use crate::storage::{FinalizeOutcome, MessageId, SqliteStorage};

/// Idempotent finalizer over the store
#[derive(Debug, Clone)]
pub struct Finalizer {
    storage: SqliteStorage,
}

impl Finalizer {
    /// Creates a finalizer over `storage`
    pub fn new(storage: SqliteStorage) -> Self {
        Self { storage }
    }

    /// Marks `message_id` final
    ///
    /// Uses `known_text` when given, otherwise the concatenated chunk log.
    /// A message that is already final is left untouched.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown message and `Persistence` when the
    /// store fails; the message then stays eligible for recovery.
    pub fn finalize(
        &self,
        message_id: MessageId,
        known_text: Option<&str>,
    ) -> Result<FinalizeOutcome> {
        let result = self.storage.finalize_message(message_id, known_text);
        match &result {
            Ok(FinalizeOutcome::Finalized {
                text,
                chunks_deleted,
            }) => {
                record_finalization("finalized");
                tracing::debug!(
                    message_id,
                    text_chars = text.chars().count(),
                    chunks_deleted,
                    "Finalized message"
                );
            }
            Ok(FinalizeOutcome::AlreadyFinal) => {
                record_finalization("already_final");
                tracing::debug!(message_id, "Message already final");
            }
            Err(_) => record_finalization("failed"),
        }
        result
    }

    /// Finalizes and logs failures instead of returning them
    ///
    /// Used after the caller has already been answered, when nobody is left
    /// to receive the error.
    pub fn finalize_or_log(
        &self,
        message_id: MessageId,
        known_text: Option<&str>,
    ) -> Option<FinalizeOutcome> {
        match self.finalize(message_id, known_text) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::error!(
                    message_id,
                    error = %e,
                    "Failed to finalize message; leaving it for recovery"
                );
                None
            }
        }
    }

    /// [`Finalizer::finalize_or_log`] on the blocking thread pool
    pub async fn finalize_or_log_async(
        &self,
        message_id: MessageId,
        known_text: Option<String>,
    ) -> Option<FinalizeOutcome> {
        let finalizer = self.clone();
        let task = tokio::task::spawn_blocking(move || {
            finalizer.finalize_or_log(message_id, known_text.as_deref())
        });
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    message_id,
                    error = %e,
                    "Finalization task failed; leaving message for recovery"
                );
                None
            }
        }
    }
}
