//! Data model shared across the council subsystem: sessions, messages, and
//! the event stream the orchestrator produces.

use serde::{Deserialize, Serialize};

/// Selects the participant model set and chairman for a council run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Lite,
    Ultra,
}

impl Default for Mode {
    fn default() -> Self {
        Self::Lite
    }
}

/// A user turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub content: String,
    pub timestamp: u64,
}

/// One participant's stage 1 answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage1Answer {
    pub model: String,
    pub response: String,
    pub response_ms: u64,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

/// One evaluator's stage 2 peer review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage2Review {
    pub model: String,
    pub ranking_text: String,
    pub parsed_order: Vec<String>,
    pub response_ms: u64,
    pub tokens: Option<u64>,
}

/// The chairman's stage 3 synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage3Synthesis {
    pub model: String,
    pub response: String,
    pub reasoning: Option<String>,
    pub response_ms: u64,
    pub tokens: Option<u64>,
    pub reasoning_tokens: Option<u64>,
}

/// One aggregate ranking entry: a model's average position across evaluators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregateRankingEntry {
    pub model: String,
    pub average_position: f64,
    pub ranking_count: u32,
}

/// A fully persisted assistant turn. Invariant: `stage1` is non-empty iff
/// this message was persisted at all; `stage2` absent implies cancellation
/// occurred before stage 2 started; `stage3` absent implies cancellation
/// occurred before stage 3 completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub stage1: Vec<Stage1Answer>,
    pub stage2: Option<Vec<Stage2Review>>,
    pub stage3: Option<Stage3Synthesis>,
    pub mode: Mode,
    pub was_aborted: Option<bool>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Turn {
    User(Message),
    Assistant(AssistantMessage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilSession {
    pub user_id: String,
    pub session_id: String,
    pub title: String,
    pub messages: Vec<Turn>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Current stage of an in-flight job, as exposed by the status operation
/// and tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Stage1,
    Stage2,
    Stage3,
}

/// Tagged event emitted by the orchestrator and broadcast to subscribers.
/// Serializes as `{"type": "...", ...fields}` for the SSE wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Stage1Start,
    Stage1Chunk { model: String, delta: String },
    Stage1ModelComplete { model: String, response_ms: u64, tokens: Option<u64> },
    Stage1Response { answer: Stage1Answer },
    Stage1Complete,

    Stage2Start,
    Stage2Chunk { model: String, delta: String },
    Stage2ModelComplete { model: String, response_ms: u64, tokens: Option<u64> },
    Stage2Response { review: Stage2Review },
    Stage2Complete {
        label_to_model: std::collections::BTreeMap<String, String>,
        aggregate: Vec<AggregateRankingEntry>,
    },

    Stage3Start,
    Stage3ReasoningChunk { delta: String },
    Stage3Chunk { delta: String },
    Stage3Response { synthesis: Stage3Synthesis },

    TitleComplete { title: String },
    Heartbeat { ts: u64 },
    Complete,
    Error { message: String },
    Reconnected { stage: Option<Stage>, user_message: String },
}
