//! Stop requests
//!
//! Stopping only signals the generation's token. The generation task
//! observes the signal, finalizes the text produced so far and releases its
//! registry entry; nothing here writes to the store.

use crate::access::AccessPolicy;
use crate::error::{Result, ThreadlineError};
use crate::generation::registry::StreamRegistry;
use crate::storage::{MessageId, SqliteStorage};
use serde::Serialize;

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOutcome {
    /// Message the request targeted
    pub message_id: MessageId,
    /// False when no generation was running for the message
    pub stopped: bool,
}

/// Signals the generation writing `message_id` to stop
///
/// # Errors
///
/// `NotFound` when the message does not exist and `PermissionDenied` when
/// `requester` may not write to its conversation. A message that already
/// finished is not an error; the outcome then reports `stopped: false`.
pub fn request_stop(
    storage: &SqliteStorage,
    registry: &StreamRegistry,
    policy: &dyn AccessPolicy,
    message_id: MessageId,
    requester: &str,
) -> Result<StopOutcome> {
    let (message, conversation) = storage
        .get_message_with_conversation(message_id)?
        .ok_or_else(|| ThreadlineError::NotFound(format!("message {}", message_id)))?;

    if !policy.can_write(&conversation, requester) {
        return Err(ThreadlineError::PermissionDenied(format!(
            "user {} may not stop message {}",
            requester, message_id
        ))
        .into());
    }

    let stopped = registry.cancel(message_id);
    if stopped {
        tracing::info!(message_id, requester, "Stop requested");
    } else {
        tracing::debug!(
            message_id,
            is_final = message.is_final,
            "Stop requested for a message with no running generation"
        );
    }

    Ok(StopOutcome {
        message_id,
        stopped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::OwnerOrSharedPolicy;
    use crate::error::kind_of;
    use crate::test_utils::{storage_with_in_flight_message, temp_storage};

    #[test]
    fn test_stop_signals_registered_token() {
        let (storage, _dir) = temp_storage();
        let message_id = storage_with_in_flight_message(&storage);
        let registry = StreamRegistry::new();
        let token = registry.register(message_id).unwrap();

        let outcome =
            request_stop(&storage, &registry, &OwnerOrSharedPolicy, message_id, "alice").unwrap();

        assert!(outcome.stopped);
        assert!(token.is_cancelled());
        // The store is untouched until the generation finalizes.
        assert!(!storage.get_message(message_id).unwrap().unwrap().is_final);
    }

    #[test]
    fn test_stop_without_running_generation() {
        let (storage, _dir) = temp_storage();
        let message_id = storage_with_in_flight_message(&storage);
        let outcome = request_stop(
            &storage,
            &StreamRegistry::new(),
            &OwnerOrSharedPolicy,
            message_id,
            "alice",
        )
        .unwrap();
        assert!(!outcome.stopped);
    }

    #[test]
    fn test_stop_unknown_message() {
        let (storage, _dir) = temp_storage();
        let err = request_stop(
            &storage,
            &StreamRegistry::new(),
            &OwnerOrSharedPolicy,
            999,
            "alice",
        )
        .unwrap_err();
        assert!(matches!(kind_of(&err), Some(ThreadlineError::NotFound(_))));
    }

    #[test]
    fn test_stop_by_non_writer_is_denied() {
        let (storage, _dir) = temp_storage();
        let message_id = storage_with_in_flight_message(&storage);
        let registry = StreamRegistry::new();
        let token = registry.register(message_id).unwrap();

        let err = request_stop(&storage, &registry, &OwnerOrSharedPolicy, message_id, "mallory")
            .unwrap_err();

        assert!(matches!(
            kind_of(&err),
            Some(ThreadlineError::PermissionDenied(_))
        ));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_outcome_serializes_camel_case() {
        let json = serde_json::to_value(StopOutcome {
            message_id: 4,
            stopped: true,
        })
        .unwrap();
        assert_eq!(json["messageId"], 4);
        assert_eq!(json["stopped"], true);
    }
}
