use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use threadline::access::OwnerOrSharedPolicy;
use threadline::generation::{GenerationOrchestrator, GenerationSettings, StreamRegistry};
use threadline::providers::Provider;
use threadline::storage::{MessageId, SqliteStorage};

#[allow(dead_code)]
pub fn create_temp_storage() -> (SqliteStorage, TempDir) {
    let tmp = TempDir::new().expect("failed to create tempdir");
    let db_path = tmp.path().join("threadline.db");
    let storage =
        SqliteStorage::new_with_path(db_path).expect("failed to create sqlite storage with path");
    (storage, tmp)
}

#[allow(dead_code)]
pub fn orchestrator_with<P>(storage: &SqliteStorage, provider: P) -> GenerationOrchestrator
where
    P: Provider + 'static,
{
    let settings = GenerationSettings {
        generate_titles: false,
        ..GenerationSettings::default()
    };
    GenerationOrchestrator::new(
        storage.clone(),
        Arc::new(provider),
        StreamRegistry::new(),
        Arc::new(OwnerOrSharedPolicy),
        settings,
    )
}

#[allow(dead_code)]
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[allow(dead_code)]
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
