mod common;

use common::{create_temp_storage, orchestrator_with, wait_for_chunks, wait_until};
use std::time::Duration;
use threadline::access::OwnerOrSharedPolicy;
use threadline::error::{kind_of, ThreadlineError};
use threadline::generation::{
    request_stop, ChunkLog, Finalizer, GenerationOutcome, RecoverySweeper, StreamRegistry,
};
use threadline::providers::{ScriptEnd, ScriptedProvider};
use threadline::storage::{FinalizeOutcome, Sender, SqliteStorage};

fn in_flight_message(storage: &SqliteStorage) -> i64 {
    let (conversation, _) = storage
        .begin_turn("alice", None, "Hi", &OwnerOrSharedPolicy)
        .unwrap();
    storage
        .insert_assistant_placeholder(&conversation.id)
        .unwrap()
        .id
}

#[tokio::test]
async fn test_chunk_indices_are_gap_free_and_ordered() {
    let (storage, _tmp) = create_temp_storage();
    let message_id = in_flight_message(&storage);
    let fragments = ["The ", "quick ", "brown ", "fox ", "jumps"];

    let log = ChunkLog::new(storage.clone());
    let mut writer = log.writer(message_id);
    for fragment in fragments {
        writer.append(fragment).await.unwrap();
    }

    let chunks = storage.list_chunks(message_id).unwrap();
    let indices: Vec<i64> = chunks.iter().map(|c| c.chunk_index).collect();
    assert_eq!(indices, (0..fragments.len() as i64).collect::<Vec<_>>());
    assert_eq!(log.text(message_id).unwrap(), fragments.concat());
}

#[test]
fn test_finalization_is_idempotent() {
    let (storage, _tmp) = create_temp_storage();
    let message_id = in_flight_message(&storage);
    storage.insert_chunk(message_id, 0, "par").unwrap();
    storage.insert_chunk(message_id, 1, "tial").unwrap();
    let finalizer = Finalizer::new(storage.clone());

    finalizer.finalize(message_id, None).unwrap();
    let second = finalizer.finalize(message_id, None).unwrap();

    assert_eq!(second, FinalizeOutcome::AlreadyFinal);
    let message = storage.get_message(message_id).unwrap().unwrap();
    assert_eq!(message.final_text, "partial");
    assert!(storage.list_chunks(message_id).unwrap().is_empty());
}

#[test]
fn test_known_text_takes_precedence_over_chunks() {
    let (storage, _tmp) = create_temp_storage();
    let message_id = in_flight_message(&storage);
    storage.insert_chunk(message_id, 0, "draft").unwrap();

    Finalizer::new(storage.clone())
        .finalize(message_id, Some("final"))
        .unwrap();

    assert_eq!(
        storage.get_message(message_id).unwrap().unwrap().final_text,
        "final"
    );
}

#[tokio::test]
async fn test_cancel_after_fragments_keeps_partial_text() {
    let (storage, _tmp) = create_temp_storage();
    let provider = ScriptedProvider::new(["Hel", "lo"]).with_end(ScriptEnd::Hold);
    let orchestrator = orchestrator_with(&storage, provider);

    let started = orchestrator.generate("alice", None, "Hi").await.unwrap();
    let message_id = started.message_id;
    wait_for_chunks(&storage, message_id, 2).await;

    assert!(orchestrator.stop(message_id, "alice").unwrap().stopped);
    let outcome = started.wait().await;

    assert_eq!(
        outcome,
        GenerationOutcome::Cancelled {
            text: "Hello".into()
        }
    );
    let message = storage.get_message(message_id).unwrap().unwrap();
    assert!(message.is_final);
    assert_eq!(message.final_text, "Hello");
    assert!(storage.list_chunks(message_id).unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_before_any_fragment_finalizes_empty() {
    let (storage, _tmp) = create_temp_storage();
    let provider = ScriptedProvider::new(Vec::<String>::new()).with_end(ScriptEnd::Hold);
    let orchestrator = orchestrator_with(&storage, provider);

    let started = orchestrator.generate("alice", None, "Hi").await.unwrap();
    let message_id = started.message_id;
    assert!(orchestrator.stop(message_id, "alice").unwrap().stopped);

    assert_eq!(
        started.wait().await,
        GenerationOutcome::Cancelled {
            text: String::new()
        }
    );
    let message = storage.get_message(message_id).unwrap().unwrap();
    assert!(message.is_final);
    assert_eq!(message.final_text, "");
}

#[test]
fn test_stop_without_handle_leaves_message_alone() {
    let (storage, _tmp) = create_temp_storage();
    let message_id = in_flight_message(&storage);
    storage.insert_chunk(message_id, 0, "x").unwrap();
    let before = storage.get_message(message_id).unwrap().unwrap();

    let outcome = request_stop(
        &storage,
        &StreamRegistry::new(),
        &OwnerOrSharedPolicy,
        message_id,
        "alice",
    )
    .unwrap();

    assert!(!outcome.stopped);
    assert_eq!(storage.get_message(message_id).unwrap().unwrap(), before);
    assert_eq!(storage.list_chunks(message_id).unwrap().len(), 1);
}

#[test]
fn test_recovery_sweep_finalizes_orphan() {
    let (storage, _tmp) = create_temp_storage();
    let message_id = in_flight_message(&storage);
    storage.insert_chunk(message_id, 0, "X").unwrap();
    storage.insert_chunk(message_id, 1, "Y").unwrap();

    let report = RecoverySweeper::new(storage.clone(), StreamRegistry::new())
        .sweep(Duration::ZERO)
        .unwrap();

    assert_eq!(report.finalized, 1);
    let message = storage.get_message(message_id).unwrap().unwrap();
    assert_eq!(message.final_text, "XY");
    assert!(message.is_final);
    assert!(storage.list_chunks(message_id).unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_generation_is_recovered_by_sweep() {
    let (storage, _tmp) = create_temp_storage();
    let provider = ScriptedProvider::new(["X", "Y"]).with_end(ScriptEnd::Fail("boom".into()));
    let orchestrator = orchestrator_with(&storage, provider);

    let started = orchestrator.generate("alice", None, "Hi").await.unwrap();
    let conversation_id = started.conversation_id.clone();
    let message_id = started.message_id;
    assert!(matches!(
        started.wait().await,
        GenerationOutcome::Failed { .. }
    ));

    // The conversation stays blocked until the orphan is recovered.
    let blocked = orchestrator
        .generate("alice", Some(&conversation_id), "again")
        .await
        .unwrap_err();
    assert!(matches!(
        kind_of(&blocked),
        Some(ThreadlineError::GenerationInProgress(_))
    ));

    RecoverySweeper::new(storage.clone(), orchestrator.registry().clone())
        .sweep(Duration::ZERO)
        .unwrap();
    assert_eq!(
        storage.get_message(message_id).unwrap().unwrap().final_text,
        "XY"
    );
    assert!(orchestrator
        .generate("alice", Some(&conversation_id), "again")
        .await
        .is_ok());
}

#[tokio::test]
async fn test_sweep_does_not_touch_running_generation() {
    let (storage, _tmp) = create_temp_storage();
    let provider = ScriptedProvider::new(["A"]).with_end(ScriptEnd::Hold);
    let orchestrator = orchestrator_with(&storage, provider);

    let started = orchestrator.generate("alice", None, "Hi").await.unwrap();
    let message_id = started.message_id;
    wait_for_chunks(&storage, message_id, 1).await;

    let report = RecoverySweeper::new(storage.clone(), orchestrator.registry().clone())
        .sweep(Duration::ZERO)
        .unwrap();
    assert_eq!(report.skipped_active, 1);
    assert!(!storage.get_message(message_id).unwrap().unwrap().is_final);

    orchestrator.stop(message_id, "alice").unwrap();
    assert_eq!(
        started.wait().await,
        GenerationOutcome::Cancelled { text: "A".into() }
    );
}

#[tokio::test]
async fn test_concurrent_conversations_generate_independently() {
    let (storage, _tmp) = create_temp_storage();
    let provider = ScriptedProvider::new(["a", "b", "c"]).with_delay(Duration::from_millis(5));
    let orchestrator = orchestrator_with(&storage, provider);

    let mut started = Vec::new();
    for user in ["alice", "bob", "carol"] {
        started.push(orchestrator.generate(user, None, "Hi").await.unwrap());
    }
    for generation in started {
        assert_eq!(
            generation.wait().await,
            GenerationOutcome::Completed { text: "abc".into() }
        );
    }
    assert!(wait_until(Duration::from_secs(1), || orchestrator.registry().is_empty()).await);
}

#[tokio::test]
async fn test_stop_by_other_user_denied_on_private_conversation() {
    let (storage, _tmp) = create_temp_storage();
    let provider = ScriptedProvider::new(["A"]).with_end(ScriptEnd::Hold);
    let orchestrator = orchestrator_with(&storage, provider);

    let started = orchestrator.generate("alice", None, "Hi").await.unwrap();
    let err = orchestrator.stop(started.message_id, "bob").unwrap_err();
    assert!(matches!(
        kind_of(&err),
        Some(ThreadlineError::PermissionDenied(_))
    ));

    orchestrator.stop(started.message_id, "alice").unwrap();
    started.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejected_concurrent_turn_leaves_no_user_message() {
    let (storage, _tmp) = create_temp_storage();
    let provider = ScriptedProvider::new(["ok"]).with_end(ScriptEnd::Hold);
    let orchestrator = orchestrator_with(&storage, provider);

    let first = orchestrator.generate("alice", None, "start").await.unwrap();
    let conversation_id = first.conversation_id.clone();
    orchestrator.stop(first.message_id, "alice").unwrap();
    first.wait().await;

    for round in 0..10 {
        let attempts: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|text| {
                let orchestrator = orchestrator.clone();
                let conversation_id = conversation_id.clone();
                tokio::spawn(async move {
                    orchestrator
                        .generate("alice", Some(&conversation_id), text)
                        .await
                })
            })
            .collect();

        let mut admitted = Vec::new();
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(started) => admitted.push(started),
                Err(e) => assert!(matches!(
                    kind_of(&e),
                    Some(ThreadlineError::GenerationInProgress(_))
                )),
            }
        }
        assert_eq!(admitted.len(), 1, "round {}", round);
        for started in admitted {
            orchestrator.stop(started.message_id, "alice").unwrap();
            started.wait().await;
        }
    }

    let messages = storage.list_messages(&conversation_id).unwrap();
    let users = messages
        .iter()
        .filter(|m| m.sender == Sender::User)
        .count();
    let answers = messages.len() - users;
    assert_eq!(users, 11);
    assert_eq!(answers, 11);
    assert!(messages.iter().all(|m| m.is_final));
}
