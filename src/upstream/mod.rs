pub mod client;

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// One message in a chat-completion request, in wire order.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

/// Request shape accepted by both [`client::UpstreamClient::complete_blocking`]
/// and [`client::UpstreamClient::complete_streaming`].
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub reasoning_effort: Option<String>,
    pub deadline: Instant,
    pub cancellation_token: CancellationToken,
}

/// Result of a non-streaming completion.
#[derive(Debug, Clone)]
pub struct CompletionResult {
    pub text: String,
    pub response_ms: u64,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

/// One delta from a streaming completion.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    Content(String),
    Reasoning(String),
    /// Terminal frame; may carry usage if the upstream reported it.
    Done {
        prompt_tokens: Option<u64>,
        completion_tokens: Option<u64>,
    },
}

pub(crate) const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const HEADERS_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024;
