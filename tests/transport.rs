//! Integration tests for the Stream Transport (§4.6): reconnection replay
//! ordering and the stage-boundary rules that govern it (scenario 5 in
//! SPEC_FULL.md §8).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use council::model::{Event, Mode, Stage, Stage1Answer};
use council::registry::ProcessingRegistry;
use council::transport::reconnect_replay;

#[tokio::test]
async fn reconnect_mid_stage1_replays_completed_answers_then_the_in_progress_chunk() {
    let registry = ProcessingRegistry::new(10, Duration::from_secs(30), Duration::from_secs(600));
    registry.register("u1", "s1", "hi".to_string(), Mode::Lite, CancellationToken::new()).await;

    registry.record_event("u1", "s1", &Event::Stage1Start).await;
    registry
        .record_event("u1", "s1", &Event::Stage1Chunk { model: "M1".to_string(), delta: "He".to_string() })
        .await;
    registry
        .record_event("u1", "s1", &Event::Stage1Chunk { model: "M1".to_string(), delta: "llo".to_string() })
        .await;

    let events = reconnect_replay(&registry, "u1", "s1").await.expect("record exists");

    assert!(matches!(events[0], Event::Stage1Start));
    let chunk = events.iter().find(|e| matches!(e, Event::Stage1Chunk { .. })).expect("one coalesced chunk");
    match chunk {
        Event::Stage1Chunk { model, delta } => {
            assert_eq!(model, "M1");
            assert_eq!(delta, "Hello", "reconnect must coalesce all accumulated content into a single chunk");
        }
        _ => unreachable!(),
    }
    assert!(
        !events.iter().any(|e| matches!(e, Event::Stage1Complete)),
        "stage1_complete must not be replayed while still in stage1"
    );

    let reconnected = events.last().expect("marker is last");
    match reconnected {
        Event::Reconnected { stage, user_message } => {
            assert_eq!(*stage, Some(Stage::Stage1));
            assert_eq!(user_message, "hi");
        }
        other => panic!("expected reconnected marker, got {other:?}"),
    }
}

#[tokio::test]
async fn reconnect_past_stage1_does_not_replay_in_progress_chunks() {
    let registry = ProcessingRegistry::new(10, Duration::from_secs(30), Duration::from_secs(600));
    registry.register("u1", "s1", "hi".to_string(), Mode::Lite, CancellationToken::new()).await;

    registry.record_event("u1", "s1", &Event::Stage1Start).await;
    let answer = Stage1Answer { model: "M1".to_string(), response: "Hello".to_string(), response_ms: 50, prompt_tokens: None, completion_tokens: None };
    registry.record_event("u1", "s1", &Event::Stage1Response { answer }).await;
    registry.record_event("u1", "s1", &Event::Stage1Complete).await;
    registry.record_event("u1", "s1", &Event::Stage2Start).await;
    registry
        .record_event("u1", "s1", &Event::Stage2Chunk { model: "M1".to_string(), delta: "ranking so far".to_string() })
        .await;

    let events = reconnect_replay(&registry, "u1", "s1").await.expect("record exists");

    assert!(events.iter().any(|e| matches!(e, Event::Stage1Response { .. })));
    assert!(events.iter().any(|e| matches!(e, Event::Stage1Complete)), "stage1 is done, so stage1_complete must replay");
    assert!(events.iter().any(|e| matches!(e, Event::Stage2Start)));
    assert!(events.iter().any(|e| matches!(e, Event::Stage2Chunk { .. })), "in-progress stage2 chunk must replay");
    assert!(!events.iter().any(|e| matches!(e, Event::Stage2Complete { .. })), "stage2 hasn't completed yet");

    match events.last().unwrap() {
        Event::Reconnected { stage, .. } => assert_eq!(*stage, Some(Stage::Stage2)),
        other => panic!("expected reconnected marker, got {other:?}"),
    }
}

#[tokio::test]
async fn reconnect_with_no_active_record_returns_none() {
    let registry = ProcessingRegistry::new(10, Duration::from_secs(30), Duration::from_secs(600));
    assert!(reconnect_replay(&registry, "nobody", "nothing").await.is_none());
}

#[tokio::test]
async fn reconnect_then_live_events_preserve_prefix_ordering() {
    let registry = ProcessingRegistry::new(10, Duration::from_secs(30), Duration::from_secs(600));
    registry.register("u1", "s1", "hi".to_string(), Mode::Lite, CancellationToken::new()).await;
    registry.record_event("u1", "s1", &Event::Stage1Start).await;
    registry
        .record_event("u1", "s1", &Event::Stage1Chunk { model: "M1".to_string(), delta: "He".to_string() })
        .await;

    let replay = reconnect_replay(&registry, "u1", "s1").await.expect("record exists");
    let (tx, mut rx) = tokio::sync::mpsc::channel(replay.len() + 8);
    for event in &replay {
        tx.try_send(event.clone()).expect("buffer large enough for replay");
    }
    let subscriber = Arc::new(council::registry::ChannelSubscriber(tx));
    Arc::clone(&registry).add_client("u1", "s1", subscriber).await.expect("record exists");

    registry.record_event("u1", "s1", &Event::Stage1ModelComplete { model: "M1".to_string(), response_ms: 10, tokens: None }).await;
    registry.broadcast("u1", "s1", Event::Stage1ModelComplete { model: "M1".to_string(), response_ms: 10, tokens: None }).await;

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    assert_eq!(seen.len(), replay.len() + 1, "live event must be appended after the full replay prefix");
    assert!(matches!(seen.last(), Some(Event::Stage1ModelComplete { .. })));
}
