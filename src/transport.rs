//! Stream Transport: wraps the orchestrator's event stream for one
//! subscriber — records into the registry, broadcasts, emits periodic
//! heartbeats, and replays accumulated state on reconnect. Transport-
//! agnostic: binding a [`crate::registry::Subscriber`] to an actual HTTP
//! response body is the external adapter's job (SPEC_FULL.md §1).
//!
//! Grounded on `other_examples/18fe0511_ccheney-reflex__src-gateway-streaming.rs.rs`'s
//! event-to-wire-frame mapping idiom.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use crate::model::{Event, Stage};
use crate::registry::{ChannelSubscriber, ProcessingRegistry};

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Formats one event as a single SSE wire frame: `data: <json>\n\n`.
pub fn format_sse_frame(event: &Event) -> String {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("data: {json}\n\n")
}

/// Drives one subscriber's lifetime against a running orchestrator event
/// stream: records each event into the registry, broadcasts it, runs a
/// periodic heartbeat, and calls `complete` once the terminal event passes
/// through. `fence` is the generation returned by `ProcessingRegistry::register`.
pub async fn drive(
    registry: Arc<ProcessingRegistry>,
    user_id: String,
    session_id: String,
    fence: u64,
    mut orchestrator_events: mpsc::Receiver<Event>,
    heartbeat_interval: std::time::Duration,
) {
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            event = orchestrator_events.recv() => {
                let Some(event) = event else { break };
                registry.record_event(&user_id, &session_id, &event).await;
                let terminal = matches!(event, Event::Complete | Event::Error { .. });
                registry.broadcast(&user_id, &session_id, event).await;
                if terminal {
                    registry.complete(&user_id, &session_id, Some(fence)).await;
                    return;
                }
            }
            _ = heartbeat.tick() => {
                registry.broadcast(&user_id, &session_id, Event::Heartbeat { ts: now_millis() }).await;
            }
        }
    }
}

/// Attaches a new live subscriber, returning a receiver of wire-formatted
/// frames. Cleans up via `remove_client` when dropped by the caller.
pub async fn subscribe(
    registry: &Arc<ProcessingRegistry>,
    user_id: &str,
    session_id: &str,
    buffer: usize,
) -> Option<(mpsc::Receiver<Event>, crate::registry::SubscriptionHandle)> {
    let (tx, rx) = mpsc::channel(buffer);
    let subscriber = Arc::new(ChannelSubscriber(tx));
    let handle = Arc::clone(registry).add_client(user_id, session_id, subscriber).await?;
    Some((rx, handle))
}

/// Builds the replay sequence for a reconnecting subscriber per §4.6: a
/// stage-ordered reconstruction of accumulated state followed by the
/// `reconnected` marker. Returns `None` if no active record exists.
pub async fn reconnect_replay(registry: &Arc<ProcessingRegistry>, user_id: &str, session_id: &str) -> Option<Vec<Event>> {
    let state = registry.get_replay_state(user_id, session_id).await?;
    let mut events = Vec::new();

    let past_stage1 = matches!(state.current_stage, Some(Stage::Stage2) | Some(Stage::Stage3));
    let in_stage1 = matches!(state.current_stage, Some(Stage::Stage1));
    if !state.stage1_results.is_empty() || in_stage1 {
        events.push(Event::Stage1Start);
        for answer in &state.stage1_results {
            events.push(Event::Stage1Response { answer: answer.clone() });
        }
        if in_stage1 {
            for (model, content) in &state.stage1_streaming {
                events.push(Event::Stage1Chunk { model: model.clone(), delta: content.clone() });
            }
        }
        if past_stage1 {
            events.push(Event::Stage1Complete);
        }
    }

    let past_stage2 = matches!(state.current_stage, Some(Stage::Stage3));
    let in_stage2 = matches!(state.current_stage, Some(Stage::Stage2));
    if !state.stage2_results.is_empty() || in_stage2 {
        events.push(Event::Stage2Start);
        for review in &state.stage2_results {
            events.push(Event::Stage2Response { review: review.clone() });
        }
        if in_stage2 {
            for (model, content) in &state.stage2_streaming {
                events.push(Event::Stage2Chunk { model: model.clone(), delta: content.clone() });
            }
        }
        if past_stage2 && !state.label_to_model.is_empty() {
            events.push(Event::Stage2Complete {
                label_to_model: state.label_to_model.clone(),
                aggregate: state.aggregate.clone(),
            });
        }
    }

    let in_stage3 = matches!(state.current_stage, Some(Stage::Stage3));
    if in_stage3 || !state.stage3_content.is_empty() || !state.stage3_reasoning.is_empty() {
        events.push(Event::Stage3Start);
        if !state.stage3_reasoning.is_empty() {
            events.push(Event::Stage3ReasoningChunk { delta: state.stage3_reasoning.clone() });
        }
        if !state.stage3_content.is_empty() {
            events.push(Event::Stage3Chunk { delta: state.stage3_content.clone() });
        }
    }

    events.push(Event::Reconnected { stage: state.current_stage, user_message: state.user_message });
    Some(events)
}
