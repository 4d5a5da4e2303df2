//! Stage Orchestrator: drives the three-stage council protocol for one
//! `(user_id, session_id, user_message, mode)` and emits the `Event`
//! tagged union defined in [`crate::model`].
//!
//! Grounded on `ReviewExecutor::execute` (`src/review.rs`) for the overall
//! build-requests → fan-out → collect → persist shape, generalized from one
//! fan-out stage to three sequential ones, and on its cancellation-aware
//! partial-result construction for the cutoff/grace-drain behavior.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::fanout::{fan_out, FanoutEvent};
use crate::model::{
    AssistantMessage, Event, Message, Mode, Stage1Answer, Stage2Review, Stage3Synthesis, Turn,
};
use crate::ranking;
use crate::session::SessionStore;
use crate::upstream::client::UpstreamClient;
use crate::upstream::{ChatMessage, CompletionRequest, StreamDelta};

const SYSTEM_PROMPT: &str = "You are one of several expert advisors answering a user's question. \
Answer directly and completely; you will not see the other advisors' answers yet.";

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

fn label_for(index: usize) -> String {
    // A, B, C, ... Z, AA, AB, ... matches the spec's "letter" labels for any
    // realistic council size (26 participants would already be unusual).
    let letter = (b'A' + (index % 26) as u8) as char;
    format!("Response {letter}")
}

/// Accumulated state kept alongside the event stream so that a mid-stage
/// cancellation can build a partial `AssistantMessage` without consulting
/// the registry (the registry keeps its own independent copy for replay).
#[derive(Default)]
struct PartialState {
    stage1: Vec<Stage1Answer>,
    stage1_streaming: std::collections::HashMap<String, String>,
    stage2: Vec<Stage2Review>,
    stage2_streaming: std::collections::HashMap<String, String>,
    stage3_content: String,
    stage3_reasoning: String,
}

impl PartialState {
    /// Builds the assistant message to persist on cancellation. Returns
    /// `None` when stage1 ended up empty (nothing worth saving — per the
    /// invariant that a persisted message always has at least one stage1
    /// answer).
    fn into_assistant_message(mut self, mode: Mode) -> Option<AssistantMessage> {
        for (model, text) in self.stage1_streaming.drain() {
            // Open question (a): empty-string entries are not promoted;
            // non-empty whitespace-only ones are.
            if !text.is_empty() {
                self.stage1.push(Stage1Answer {
                    model,
                    response: text,
                    response_ms: 0,
                    prompt_tokens: None,
                    completion_tokens: None,
                });
            }
        }
        if self.stage1.is_empty() {
            return None;
        }

        for (model, text) in self.stage2_streaming.drain() {
            if !text.is_empty() {
                self.stage2.push(Stage2Review {
                    model,
                    ranking_text: text.clone(),
                    parsed_order: ranking::parse_ranking(&text),
                    response_ms: 0,
                    tokens: None,
                });
            }
        }
        let stage2 = if self.stage2.is_empty() { None } else { Some(self.stage2) };

        let stage3 = if !self.stage3_content.is_empty() || !self.stage3_reasoning.is_empty() {
            Some(Stage3Synthesis {
                model: String::new(),
                response: self.stage3_content,
                reasoning: if self.stage3_reasoning.is_empty() { None } else { Some(self.stage3_reasoning) },
                response_ms: 0,
                tokens: None,
                reasoning_tokens: None,
            })
        } else {
            None
        };

        Some(AssistantMessage {
            stage1: self.stage1,
            stage2,
            stage3,
            mode,
            was_aborted: Some(true),
            timestamp: now_millis(),
        })
    }
}

pub struct Orchestrator<S: SessionStore> {
    config: Arc<Config>,
    client: Arc<UpstreamClient>,
    store: Arc<S>,
}

impl<S: SessionStore + 'static> Orchestrator<S> {
    pub fn new(config: Arc<Config>, client: Arc<UpstreamClient>, store: Arc<S>) -> Arc<Self> {
        Arc::new(Self { config, client, store })
    }

    /// Starts processing `content` for `(user_id, session_id)` under `mode`,
    /// returning a receiver of the event stream. Spawns the driving task
    /// immediately; the caller is expected to have already registered the
    /// job (and `cancel`) with the processing registry before subscribing.
    pub fn process_council_message(
        self: &Arc<Self>,
        user_id: String,
        session_id: String,
        content: String,
        mode: Mode,
        cancel: CancellationToken,
        title_callback: Option<Box<dyn FnOnce(String) + Send>>,
    ) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(256);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run(user_id, session_id, content, mode, cancel, tx, title_callback).await;
        });
        rx
    }

    async fn run(
        &self,
        user_id: String,
        session_id: String,
        content: String,
        mode: Mode,
        cancel: CancellationToken,
        tx: mpsc::Sender<Event>,
        title_callback: Option<Box<dyn FnOnce(String) + Send>>,
    ) {
        let Ok(Some(session)) = self.store.get(&user_id, &session_id).await else {
            let _ = tx.send(Event::Error { message: "Session not found".to_string() }).await;
            return;
        };

        let is_first_message = session.messages.is_empty();
        let Some(mode_config) = self.config.modes.get(&mode) else {
            let _ = tx.send(Event::Error { message: format!("mode {mode:?} is not configured") }).await;
            return;
        };

        // Built from the session as persisted so far (not yet including this
        // turn) and carried only in memory: the user turn is never written to
        // the store on its own, only atomically with its paired assistant
        // message once one exists (success or partial-on-cancellation).
        let history = build_history(&session, self.config.recent_messages_window);
        let user_message = Message { content: content.clone(), timestamp: now_millis() };

        if is_first_message && let Some(callback) = title_callback {
            self.spawn_title_job(user_id.clone(), session_id.clone(), content.clone(), callback);
        }

        let mut partial = PartialState::default();

        // --- Stage 1: individual answers ---
        let _ = tx.send(Event::Stage1Start).await;
        let stage1_requests: Vec<(String, CompletionRequest)> = mode_config
            .participants
            .iter()
            .map(|model| {
                let mut messages = vec![ChatMessage { role: "system", content: SYSTEM_PROMPT.to_string() }];
                messages.extend(history.iter().cloned());
                messages.push(ChatMessage { role: "user", content: content.clone() });
                (
                    model.clone(),
                    CompletionRequest {
                        model: model.clone(),
                        messages,
                        max_tokens: Some(self.config.participant_max_tokens),
                        temperature: None,
                        reasoning_effort: None,
                        deadline: Instant::now() + self.config.stage1_timeout,
                        cancellation_token: cancel.clone(),
                    },
                )
            })
            .collect();

        let mut stage1_done: std::collections::HashMap<String, (u64, Option<u64>, Option<u64>)> = std::collections::HashMap::new();
        let mut rx1 = fan_out(Arc::clone(&self.client), stage1_requests);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.finalize_cancelled(&user_id, &session_id, user_message.clone(), partial, mode).await;
                    return;
                }
                event = rx1.recv() => {
                    match event {
                        Some(FanoutEvent::Delta { model, delta }) => {
                            partial.stage1_streaming.entry(model.clone()).or_default().push_str(&delta);
                            let _ = tx.send(Event::Stage1Chunk { model, delta }).await;
                        }
                        Some(FanoutEvent::Done { model, response_ms, prompt_tokens, completion_tokens }) => {
                            stage1_done.insert(model.clone(), (response_ms, prompt_tokens, completion_tokens));
                            let _ = tx.send(Event::Stage1ModelComplete { model, response_ms, tokens: completion_tokens }).await;
                        }
                        None => break,
                    }
                }
            }
        }

        for model in &mode_config.participants {
            if let Some(text) = partial.stage1_streaming.remove(model)
                && !text.is_empty()
            {
                let (response_ms, prompt_tokens, completion_tokens) =
                    stage1_done.get(model).copied().unwrap_or((0, None, None));
                let answer = Stage1Answer {
                    model: model.clone(),
                    response: text,
                    response_ms,
                    prompt_tokens,
                    completion_tokens,
                };
                let _ = tx.send(Event::Stage1Response { answer: answer.clone() }).await;
                partial.stage1.push(answer);
            }
        }

        if partial.stage1.is_empty() {
            let _ = tx.send(Event::Error { message: "All models failed to respond. Please try again.".to_string() }).await;
            return;
        }
        let _ = tx.send(Event::Stage1Complete).await;

        if cancel.is_cancelled() {
            self.finalize_cancelled(&user_id, &session_id, user_message.clone(), partial, mode).await;
            return;
        }

        // --- Stage 2: peer ranking ---
        let _ = tx.send(Event::Stage2Start).await;
        let mut label_to_model = BTreeMap::new();
        let mut ranking_prompt = String::from(
            "Rank the following anonymized responses from best to worst. \
             End your reply with a line reading exactly \"FINAL RANKING:\" followed by a \
             numbered list, best first, using the format \"1. Response A\".\n\n",
        );
        for (idx, answer) in partial.stage1.iter().enumerate() {
            let label = label_for(idx);
            label_to_model.insert(label.clone(), answer.model.clone());
            ranking_prompt.push_str(&format!("{label}:\n{}\n\n", answer.response));
        }

        let stage2_requests: Vec<(String, CompletionRequest)> = mode_config
            .participants
            .iter()
            .map(|model| {
                (
                    model.clone(),
                    CompletionRequest {
                        model: model.clone(),
                        messages: vec![ChatMessage { role: "user", content: ranking_prompt.clone() }],
                        max_tokens: Some(self.config.participant_max_tokens),
                        temperature: None,
                        reasoning_effort: None,
                        deadline: Instant::now() + self.config.stage2_timeout,
                        cancellation_token: cancel.clone(),
                    },
                )
            })
            .collect();

        let mut stage2_done: std::collections::HashMap<String, (u64, Option<u64>)> = std::collections::HashMap::new();
        let mut rx2 = fan_out(Arc::clone(&self.client), stage2_requests);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.finalize_cancelled(&user_id, &session_id, user_message.clone(), partial, mode).await;
                    return;
                }
                event = rx2.recv() => {
                    match event {
                        Some(FanoutEvent::Delta { model, delta }) => {
                            partial.stage2_streaming.entry(model.clone()).or_default().push_str(&delta);
                            let _ = tx.send(Event::Stage2Chunk { model, delta }).await;
                        }
                        Some(FanoutEvent::Done { model, response_ms, completion_tokens, .. }) => {
                            stage2_done.insert(model.clone(), (response_ms, completion_tokens));
                            let _ = tx.send(Event::Stage2ModelComplete { model, response_ms, tokens: completion_tokens }).await;
                        }
                        None => break,
                    }
                }
            }
        }

        for model in &mode_config.participants {
            if let Some(text) = partial.stage2_streaming.remove(model)
                && !text.is_empty()
            {
                let (response_ms, tokens) = stage2_done.get(model).copied().unwrap_or((0, None));
                let review = Stage2Review {
                    model: model.clone(),
                    ranking_text: text.clone(),
                    parsed_order: ranking::parse_ranking(&text),
                    response_ms,
                    tokens,
                };
                let _ = tx.send(Event::Stage2Response { review: review.clone() }).await;
                partial.stage2.push(review);
            }
        }

        let parsed_orders: Vec<Vec<String>> = partial.stage2.iter().map(|r| r.parsed_order.clone()).collect();
        let aggregate = ranking::aggregate(&parsed_orders, &label_to_model);
        let _ = tx.send(Event::Stage2Complete { label_to_model: label_to_model.clone(), aggregate }).await;

        if cancel.is_cancelled() {
            self.finalize_cancelled(&user_id, &session_id, user_message.clone(), partial, mode).await;
            return;
        }

        // --- Stage 3: chairman synthesis ---
        let _ = tx.send(Event::Stage3Start).await;
        let mut chairman_prompt = String::from(
            "You are the chairman. Synthesize one authoritative answer from the advisors' \
             responses and evaluators' rankings below. Respond in the user's language.\n\n",
        );
        for (idx, answer) in partial.stage1.iter().enumerate() {
            chairman_prompt.push_str(&format!("{}:\n{}\n\n", label_for(idx), answer.response));
        }
        for (idx, review) in partial.stage2.iter().enumerate() {
            chairman_prompt.push_str(&format!("Evaluator {}:\n{}\n\n", idx + 1, review.ranking_text));
        }

        let chairman_req = CompletionRequest {
            model: mode_config.chairman.clone(),
            messages: vec![ChatMessage { role: "user", content: chairman_prompt }],
            max_tokens: Some(self.config.chairman_max_tokens),
            temperature: None,
            reasoning_effort: Some("medium".to_string()),
            deadline: Instant::now() + self.config.stage3_timeout,
            cancellation_token: cancel.clone(),
        };

        let (tx3, mut rx3) = mpsc::channel::<StreamDelta>(64);
        let chairman_start = Instant::now();
        let producer = tokio::spawn({
            let client = Arc::clone(&self.client);
            async move { client.complete_streaming(&chairman_req, tx3).await }
        });

        let mut done_meta = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = producer.await;
                    self.finalize_cancelled(&user_id, &session_id, user_message.clone(), partial, mode).await;
                    return;
                }
                event = rx3.recv() => {
                    match event {
                        Some(StreamDelta::Content(delta)) => {
                            partial.stage3_content.push_str(&delta);
                            let _ = tx.send(Event::Stage3Chunk { delta }).await;
                        }
                        Some(StreamDelta::Reasoning(delta)) => {
                            partial.stage3_reasoning.push_str(&delta);
                            let _ = tx.send(Event::Stage3ReasoningChunk { delta }).await;
                        }
                        Some(StreamDelta::Done { prompt_tokens, completion_tokens }) => {
                            done_meta = Some((prompt_tokens, completion_tokens));
                        }
                        None => break,
                    }
                }
            }
        }
        if let Err(e) = producer.await {
            tracing::error!(error = %e, "chairman task join failed");
        }

        if partial.stage3_content.is_empty() || done_meta.is_none() {
            let _ = tx.send(Event::Error { message: "Chairman failed to synthesize response.".to_string() }).await;
            return;
        }
        let (_prompt_tokens, completion_tokens) = done_meta.unwrap();
        let synthesis = Stage3Synthesis {
            model: mode_config.chairman.clone(),
            response: partial.stage3_content.clone(),
            reasoning: if partial.stage3_reasoning.is_empty() { None } else { Some(partial.stage3_reasoning.clone()) },
            response_ms: chairman_start.elapsed().as_millis() as u64,
            tokens: completion_tokens,
            reasoning_tokens: None,
        };
        let _ = tx.send(Event::Stage3Response { synthesis: synthesis.clone() }).await;

        let assistant_message = AssistantMessage {
            stage1: partial.stage1,
            stage2: Some(partial.stage2),
            stage3: Some(synthesis),
            mode,
            was_aborted: None,
            timestamp: now_millis(),
        };
        if let Err(e) = self.store.append_assistant_message(&user_id, &session_id, user_message, assistant_message).await {
            let _ = tx.send(Event::Error { message: e.user_message() }).await;
            return;
        }
        let _ = tx.send(Event::Complete).await;
    }

    async fn finalize_cancelled(&self, user_id: &str, session_id: &str, user_message: Message, partial: PartialState, mode: Mode) {
        if let Some(message) = partial.into_assistant_message(mode)
            && let Err(e) = self.store.append_assistant_message(user_id, session_id, user_message, message).await
        {
            tracing::error!(error = %e, "failed to persist partial assistant message on cancellation");
        }
    }

    fn spawn_title_job(&self, user_id: String, session_id: String, content: String, callback: Box<dyn FnOnce(String) + Send>) {
        let client = Arc::clone(&self.client);
        let store = Arc::clone(&self.store);
        let timeout = self.config.title_timeout;
        let model = self
            .config
            .modes
            .get(&Mode::Lite)
            .map(|m| m.chairman.clone())
            .unwrap_or_default();

        tokio::spawn(async move {
            if model.is_empty() {
                return;
            }
            let req = CompletionRequest {
                model,
                messages: vec![
                    ChatMessage { role: "system", content: "Write a short (max 6 words) title for this conversation. Respond with only the title.".to_string() },
                    ChatMessage { role: "user", content },
                ],
                max_tokens: Some(32),
                temperature: None,
                reasoning_effort: None,
                deadline: Instant::now() + timeout,
                cancellation_token: CancellationToken::new(),
            };
            match tokio::time::timeout(timeout, client.complete_blocking(&req)).await {
                Ok(Ok(result)) => {
                    let title = result.text.trim().to_string();
                    if !title.is_empty() {
                        if let Err(e) = store.set_title(&user_id, &session_id, title.clone()).await {
                            tracing::warn!(error = %e, "failed to persist generated title");
                        } else {
                            callback(title);
                        }
                    }
                }
                Ok(Err(e)) => tracing::warn!(error = %e, "title generation failed"),
                Err(_) => tracing::warn!("title generation timed out"),
            }
        });
    }
}

fn build_history(session: &crate::model::CouncilSession, window: usize) -> Vec<ChatMessage> {
    let limit = window * 2;
    session
        .messages
        .iter()
        .rev()
        .filter_map(|turn| match turn {
            Turn::User(m) => Some(ChatMessage { role: "user", content: m.content.clone() }),
            Turn::Assistant(a) => a.stage3.as_ref().map(|s| ChatMessage { role: "assistant", content: s.response.clone() }),
        })
        .take(limit)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect()
}
