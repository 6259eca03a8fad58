//! Test utilities for Threadline
//!
//! Temporary stores, seeded in-flight messages and polling helpers shared by
//! the unit tests.

use crate::access::OwnerOrSharedPolicy;
use crate::storage::{MessageId, SqliteStorage};
use std::time::Duration;
use tempfile::TempDir;

/// Create a store in a fresh temporary directory
///
/// Keep the returned `TempDir` alive for as long as the store is used.
pub fn temp_storage() -> (SqliteStorage, TempDir) {
    let dir = TempDir::new().expect("Failed to create temporary directory");
    let storage = SqliteStorage::new_with_path(dir.path().join("threadline.db"))
        .expect("Failed to create test storage");
    (storage, dir)
}

/// Seed a conversation owned by `alice` with a non-final assistant message
///
/// Returns the id of the assistant placeholder.
pub fn storage_with_in_flight_message(storage: &SqliteStorage) -> MessageId {
    let (conversation, _) = storage
        .begin_turn("alice", None, "Hi", &OwnerOrSharedPolicy)
        .expect("Failed to record user turn");
    storage
        .insert_assistant_placeholder(&conversation.id)
        .expect("Failed to insert placeholder")
        .id
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until `message_id` has at least `count` persisted chunks
///
/// # Panics
///
/// Panics if the chunks do not show up within two seconds
pub async fn wait_for_chunks(storage: &SqliteStorage, message_id: MessageId, count: usize) {
    let reached = wait_until(Duration::from_secs(2), || {
        storage
            .list_chunks(message_id)
            .map(|chunks| chunks.len() >= count)
            .unwrap_or(false)
    })
    .await;
    assert!(reached, "message {} never reached {} chunks", message_id, count);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_message_is_not_final() {
        let (storage, _dir) = temp_storage();
        let id = storage_with_in_flight_message(&storage);
        let message = storage.get_message(id).unwrap().unwrap();
        assert!(!message.is_final);
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        assert!(!wait_until(Duration::from_millis(20), || false).await);
        assert!(wait_until(Duration::from_millis(20), || true).await);
    }
}
