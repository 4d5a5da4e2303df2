//! Parallel Streaming Fan-Out: concurrently consumes N upstream streams and
//! emits a single merged sequence of per-model chunks and terminals.
//!
//! Grounded on `ReviewExecutor::execute`'s one-task-per-model `JoinSet` and
//! on the multiplexer idiom of forwarding every task's output into one
//! shared channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::Id;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::upstream::client::UpstreamClient;
use crate::upstream::{CompletionRequest, StreamDelta};

/// Wall-clock cadence at which contiguous per-model deltas are coalesced
/// into a single forwarded chunk.
const COALESCE_INTERVAL: Duration = Duration::from_millis(50);

/// Per-model channel depth between the upstream client and its coalescing
/// loop. Small: the coalescing loop drains promptly.
const PER_MODEL_CHANNEL_DEPTH: usize = 64;

/// Depth of the shared output channel consumers read from.
const OUTPUT_CHANNEL_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub enum FanoutEvent {
    Delta {
        model: String,
        delta: String,
    },
    Done {
        model: String,
        response_ms: u64,
        prompt_tokens: Option<u64>,
        completion_tokens: Option<u64>,
    },
}

/// Runs one [`CompletionRequest`] per model concurrently and returns a
/// receiver of the merged, per-model-coalesced event stream. The receiver
/// closes once every model has either completed or failed; a model that
/// errors without ever streaming content simply contributes no events.
pub fn fan_out(
    client: Arc<UpstreamClient>,
    requests: Vec<(String, CompletionRequest)>,
) -> mpsc::Receiver<FanoutEvent> {
    let (out_tx, out_rx) = mpsc::channel(OUTPUT_CHANNEL_DEPTH);
    let mut set = tokio::task::JoinSet::new();
    let mut task_model_map: HashMap<Id, String> = HashMap::new();

    for (model, req) in requests {
        let client = Arc::clone(&client);
        let out_tx = out_tx.clone();
        let model_for_task = model.clone();
        let abort = set.spawn(async move { run_model(client, model, req, out_tx).await });
        task_model_map.insert(abort.id(), model_for_task);
    }
    drop(out_tx);

    tokio::spawn(async move {
        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((_, ())) => {}
                Err(e) => {
                    let model = task_model_map.get(&e.id()).cloned().unwrap_or_else(|| "<unknown>".to_string());
                    if e.is_panic() {
                        tracing::error!(model = %model, "fan-out task panicked");
                    } else {
                        tracing::warn!(model = %model, "fan-out task cancelled");
                    }
                }
            }
        }
    });

    out_rx
}

async fn run_model(
    client: Arc<UpstreamClient>,
    model: String,
    req: CompletionRequest,
    out_tx: mpsc::Sender<FanoutEvent>,
) {
    let start = Instant::now();
    let cancel = req.cancellation_token.clone();
    let (tx, mut rx) = mpsc::channel::<StreamDelta>(PER_MODEL_CHANNEL_DEPTH);

    let producer = client.complete_streaming(&req, tx);

    let consumer = async {
        let mut buf = String::new();
        let mut interval = tokio::time::interval(COALESCE_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await; // first tick fires immediately; consume it

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    if !buf.is_empty() {
                        let _ = out_tx.send(FanoutEvent::Delta { model: model.clone(), delta: std::mem::take(&mut buf) }).await;
                    }
                    return;
                }
                maybe = rx.recv() => {
                    match maybe {
                        Some(StreamDelta::Content(s)) => buf.push_str(&s),
                        Some(StreamDelta::Reasoning(_)) => {
                            // stage 1/2 fan-out does not surface reasoning; the
                            // chairman's reasoning stream is consumed directly
                            // by the orchestrator, not through this fan-out.
                        }
                        Some(StreamDelta::Done { prompt_tokens, completion_tokens }) => {
                            if !buf.is_empty() {
                                let _ = out_tx.send(FanoutEvent::Delta { model: model.clone(), delta: std::mem::take(&mut buf) }).await;
                            }
                            let _ = out_tx.send(FanoutEvent::Done {
                                model: model.clone(),
                                response_ms: start.elapsed().as_millis() as u64,
                                prompt_tokens,
                                completion_tokens,
                            }).await;
                            return;
                        }
                        None => {
                            if !buf.is_empty() {
                                let _ = out_tx.send(FanoutEvent::Delta { model: model.clone(), delta: std::mem::take(&mut buf) }).await;
                            }
                            return;
                        }
                    }
                }
                _ = interval.tick() => {
                    if !buf.is_empty() {
                        let _ = out_tx.send(FanoutEvent::Delta { model: model.clone(), delta: std::mem::take(&mut buf) }).await;
                    }
                }
            }
        }
    };

    let (producer_result, ()) = tokio::join!(producer, consumer);
    if let Err(e) = producer_result {
        tracing::warn!(model = %model, error = %e, "fan-out model failed");
    }
}
