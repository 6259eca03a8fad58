mod common;

use common::create_temp_storage;
use std::sync::Arc;
use std::time::Duration;
use threadline::access::OwnerOrSharedPolicy;
use threadline::live::{
    QueryDescriptor, QueryResult, ResultStatus, StoreQuerySource, ViewPhase, ViewStore,
    ViewSubscription,
};
use threadline::storage::{Chunk, SqliteStorage};

fn view_store(storage: &SqliteStorage) -> ViewStore {
    ViewStore::new(Arc::new(StoreQuerySource::new(storage.clone())))
}

fn in_flight_message(storage: &SqliteStorage) -> i64 {
    let (conversation, _) = storage
        .begin_turn("alice", None, "Hi", &OwnerOrSharedPolicy)
        .unwrap();
    storage
        .insert_assistant_placeholder(&conversation.id)
        .unwrap()
        .id
}

async fn next_where<F>(subscription: &mut ViewSubscription, mut accept: F) -> QueryResult
where
    F: FnMut(&QueryResult) -> bool,
{
    let mut current = subscription.current();
    while !accept(&current) {
        current = tokio::time::timeout(Duration::from_secs(2), subscription.changed())
            .await
            .expect("view never produced a matching value")
            .expect("view closed");
    }
    current
}

fn chunk_texts(result: &QueryResult) -> Vec<String> {
    result
        .decode::<Vec<Chunk>>()
        .unwrap()
        .into_iter()
        .map(|c| c.content)
        .collect()
}

#[tokio::test]
async fn test_concurrent_get_view_share_one_subscription() {
    let (storage, _tmp) = create_temp_storage();
    let message_id = in_flight_message(&storage);
    let views = view_store(&storage);
    let descriptor = QueryDescriptor::MessageChunks { message_id };

    let (a, b) = tokio::join!(
        async { views.get_view("alice", &descriptor, Duration::from_secs(5)) },
        async { views.get_view("alice", &descriptor, Duration::from_secs(5)) },
    );
    assert!(a.same_view(&b));

    let mut sub_a = a.subscribe();
    let mut sub_b = b.subscribe();
    next_where(&mut sub_a, QueryResult::is_complete).await;

    storage.insert_chunk(message_id, 0, "Hel").unwrap();

    let seen_a = next_where(&mut sub_a, |r| chunk_texts(r) == ["Hel"]).await;
    let seen_b = next_where(&mut sub_b, |r| chunk_texts(r) == ["Hel"]).await;
    assert_eq!(seen_a, seen_b);
    assert_eq!(a.materializations(), 1);
}

#[tokio::test]
async fn test_ttl_keeps_view_for_quick_resubscribe() {
    let (storage, _tmp) = create_temp_storage();
    let message_id = in_flight_message(&storage);
    let views = view_store(&storage);
    let descriptor = QueryDescriptor::MessageChunks { message_id };
    let view = views.get_view("alice", &descriptor, Duration::from_millis(300));

    let mut first = view.subscribe();
    next_where(&mut first, QueryResult::is_complete).await;
    first.unsubscribe();
    assert_eq!(view.phase(), ViewPhase::PendingTeardown);

    let mut again = view.subscribe();
    assert_eq!(view.phase(), ViewPhase::Active);
    assert_eq!(view.materializations(), 1);
    // The cached value is available immediately.
    assert!(again.current().is_complete());

    storage.insert_chunk(message_id, 0, "still live").unwrap();
    next_where(&mut again, |r| chunk_texts(r) == ["still live"]).await;
}

#[tokio::test]
async fn test_view_dematerializes_after_ttl() {
    let (storage, _tmp) = create_temp_storage();
    let message_id = in_flight_message(&storage);
    let views = view_store(&storage);
    let descriptor = QueryDescriptor::MessageChunks { message_id };
    let view = views.get_view("alice", &descriptor, Duration::from_millis(30));

    drop(view.subscribe());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(view.phase(), ViewPhase::Idle);
    assert_eq!(views.materialized_count(), 0);
    assert_eq!(views.len(), 0);

    let again = view.subscribe();
    assert_eq!(view.materializations(), 2);
    assert_eq!(views.len(), 1);
    assert_eq!(again.current().status, ResultStatus::Unknown);
}

#[tokio::test]
async fn test_status_is_unknown_until_loaded() {
    let (storage, _tmp) = create_temp_storage();
    let views = view_store(&storage);
    let descriptor = QueryDescriptor::ConversationMessages {
        conversation_id: "nope".into(),
    };
    let view = views.get_view("", &descriptor, Duration::from_secs(1));

    assert_eq!(view.current().status, ResultStatus::Unknown);
    let mut sub = view.subscribe();
    let loaded = next_where(&mut sub, QueryResult::is_complete).await;
    assert_eq!(loaded.data, serde_json::json!([]));
}

#[tokio::test]
async fn test_scopes_are_isolated() {
    let (storage, _tmp) = create_temp_storage();
    let views = view_store(&storage);
    let descriptor = QueryDescriptor::Conversation { id: "c".into() };

    let alice = views.get_view("alice", &descriptor, Duration::from_secs(1));
    let bob = views.get_view("bob", &descriptor, Duration::from_secs(1));
    assert!(!alice.same_view(&bob));
    assert_eq!(views.len(), 2);
}
