use std::time::{Duration, Instant};

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::{CouncilError, UpstreamErrorKind};
use crate::upstream::{
    CompletionRequest, CompletionResult, StreamDelta, DEFAULT_FIRST_BYTE_TIMEOUT,
    DEFAULT_STALL_TIMEOUT, HEADERS_TIMEOUT, MAX_RESPONSE_BYTES,
};

/// OpenAI-compatible chat-completions client against a single configured
/// gateway. Both the blocking and streaming forms share the same request
/// shape; only the streaming form supports a stall timeout and partial
/// forwarding on cancellation.
pub struct UpstreamClient {
    http: Client,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDeltaWire,
}

#[derive(Deserialize)]
struct StreamDeltaWire {
    content: Option<String>,
    reasoning_content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct BlockingResponse {
    choices: Vec<BlockingChoice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct BlockingChoice {
    message: BlockingMessage,
}

#[derive(Deserialize)]
struct BlockingMessage {
    content: Option<String>,
}

enum ParsedFrame {
    Delta(StreamDelta),
    Done { prompt_tokens: Option<u64>, completion_tokens: Option<u64> },
    Skip,
}

impl UpstreamClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()
            .expect("failed to build HTTP client");
        Self { http, base_url, api_key }
    }

    fn build_body(&self, req: &CompletionRequest, stream: bool) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = req
            .messages
            .iter()
            .map(|m| serde_json::json!({"role": m.role, "content": m.content}))
            .collect();

        let mut body = serde_json::json!({
            "model": req.model,
            "messages": messages,
            "stream": stream,
        });
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(ref effort) = req.reasoning_effort {
            body["reasoning"] = serde_json::json!({"effort": effort});
        }
        body
    }

    /// Non-streaming completion with retry on transient failure: up to two
    /// retries with 1s, then 2s backoff. Cancellation and permanent failures
    /// are not retried.
    pub async fn complete_blocking(&self, req: &CompletionRequest) -> Result<CompletionResult, CouncilError> {
        const BACKOFFS: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(2)];

        let mut attempt = 0usize;
        loop {
            if req.cancellation_token.is_cancelled() {
                return Err(upstream_err(&req.model, UpstreamErrorKind::Cancelled, "cancelled"));
            }
            match self.complete_blocking_once(req).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    let retryable = matches!(
                        &e,
                        CouncilError::Upstream { kind: UpstreamErrorKind::Transient, .. }
                    );
                    if !retryable || attempt >= BACKOFFS.len() {
                        return Err(e);
                    }
                    let backoff = BACKOFFS[attempt];
                    attempt += 1;
                    tracing::warn!(model = %req.model, attempt, "transient upstream failure, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = req.cancellation_token.cancelled() => {
                            return Err(upstream_err(&req.model, UpstreamErrorKind::Cancelled, "cancelled during backoff"));
                        }
                    }
                }
            }
        }
    }

    async fn complete_blocking_once(&self, req: &CompletionRequest) -> Result<CompletionResult, CouncilError> {
        let start = Instant::now();
        let body = self.build_body(req, false);

        let remaining = req
            .deadline
            .checked_duration_since(Instant::now())
            .filter(|d| *d > Duration::from_millis(100))
            .ok_or_else(|| upstream_err(&req.model, UpstreamErrorKind::Timeout, "deadline already passed"))?;
        let headers_timeout = remaining.min(HEADERS_TIMEOUT);

        let send_future = self
            .http
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send();

        let response = tokio::select! {
            _ = req.cancellation_token.cancelled() => {
                return Err(upstream_err(&req.model, UpstreamErrorKind::Cancelled, "cancelled while waiting for headers"));
            }
            result = tokio::time::timeout(headers_timeout, send_future) => {
                result
                    .map_err(|_| upstream_err(&req.model, UpstreamErrorKind::Timeout, "timed out waiting for headers"))?
                    .map_err(CouncilError::Request)?
            }
        };

        let status = response.status();
        if !status.is_success() {
            let kind = classify_status(status.as_u16());
            let text = response.text().await.unwrap_or_default();
            let truncated: String = text.chars().take(500).collect();
            return Err(upstream_err(&req.model, kind, format!("{status}: {truncated}")));
        }

        let parsed: BlockingResponse = response
            .json()
            .await
            .map_err(|e| upstream_err(&req.model, UpstreamErrorKind::Permanent, format!("malformed response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(CompletionResult {
            text: content,
            response_ms: start.elapsed().as_millis() as u64,
            prompt_tokens: parsed.usage.as_ref().and_then(|u| u.prompt_tokens),
            completion_tokens: parsed.usage.as_ref().and_then(|u| u.completion_tokens),
        })
    }

    /// Streaming completion. Forwards [`StreamDelta`] frames through `tx` as
    /// they arrive; no retries. Malformed frames are skipped. Returns `Ok`
    /// once a terminal frame has been forwarded (or the deadline/stall timer
    /// or cancellation cuts the stream short with partial content already
    /// forwarded), `Err` only when nothing was ever received.
    pub async fn complete_streaming(
        &self,
        req: &CompletionRequest,
        tx: mpsc::Sender<StreamDelta>,
    ) -> Result<(), CouncilError> {
        let start = Instant::now();
        let body = self.build_body(req, true);

        let remaining = req
            .deadline
            .checked_duration_since(Instant::now())
            .filter(|d| *d > Duration::from_millis(100))
            .ok_or_else(|| upstream_err(&req.model, UpstreamErrorKind::Timeout, "deadline already passed"))?;
        let headers_timeout = remaining.min(HEADERS_TIMEOUT);

        let send_future = self
            .http
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send();

        let response = tokio::select! {
            _ = req.cancellation_token.cancelled() => {
                return Err(upstream_err(&req.model, UpstreamErrorKind::Cancelled, "cancelled while waiting for headers"));
            }
            result = tokio::time::timeout(headers_timeout, send_future) => {
                result
                    .map_err(|_| upstream_err(&req.model, UpstreamErrorKind::Timeout, "timed out waiting for headers"))?
                    .map_err(CouncilError::Request)?
            }
        };

        let status = response.status();
        if !status.is_success() {
            let kind = classify_status(status.as_u16());
            let text = response.text().await.unwrap_or_default();
            let truncated: String = text.chars().take(500).collect();
            return Err(upstream_err(&req.model, kind, format!("{status}: {truncated}")));
        }

        let mut stream = response.bytes_stream().eventsource();
        let mut received_any = false;
        let mut total_bytes = 0usize;

        let remaining = req.deadline.checked_duration_since(Instant::now()).unwrap_or(Duration::ZERO);
        let generation_deadline = tokio::time::Instant::now() + remaining;
        let stall_timeout = DEFAULT_STALL_TIMEOUT.min(remaining);
        let first_byte_deadline = tokio::time::Instant::now() + DEFAULT_FIRST_BYTE_TIMEOUT.min(remaining);

        let mut last_chunk_at = tokio::time::Instant::now();
        let deadline_sleep = tokio::time::sleep_until(generation_deadline.min(first_byte_deadline));
        tokio::pin!(deadline_sleep);

        loop {
            let effective_deadline = if received_any {
                generation_deadline.min(last_chunk_at + stall_timeout)
            } else {
                generation_deadline.min(first_byte_deadline)
            };
            deadline_sleep.as_mut().reset(effective_deadline);

            tokio::select! {
                _ = req.cancellation_token.cancelled() => {
                    if !received_any {
                        return Err(upstream_err(&req.model, UpstreamErrorKind::Cancelled, "cancelled"));
                    }
                    return Ok(());
                }
                _ = &mut deadline_sleep => {
                    if !received_any {
                        return Err(upstream_err(&req.model, UpstreamErrorKind::Timeout, "timed out waiting for first token"));
                    }
                    return Ok(());
                }
                event = stream.next() => match event {
                    Some(Ok(ev)) => {
                        match parse_frame(&ev.data) {
                            ParsedFrame::Done { prompt_tokens, completion_tokens } => {
                                let _ = tx.send(StreamDelta::Done { prompt_tokens, completion_tokens }).await;
                                tracing::debug!(model = %req.model, ms = start.elapsed().as_millis() as u64, "stream complete");
                                return Ok(());
                            }
                            ParsedFrame::Delta(delta) => {
                                received_any = true;
                                last_chunk_at = tokio::time::Instant::now();
                                total_bytes += delta_len(&delta);
                                if total_bytes > MAX_RESPONSE_BYTES {
                                    return Err(upstream_err(&req.model, UpstreamErrorKind::Permanent, "response too large"));
                                }
                                if tx.send(delta).await.is_err() {
                                    // subscriber side gone; nothing left to do
                                    return Ok(());
                                }
                            }
                            ParsedFrame::Skip => {
                                received_any = true;
                                last_chunk_at = tokio::time::Instant::now();
                            }
                        }
                    }
                    Some(Err(e)) => {
                        if !received_any {
                            return Err(upstream_err(&req.model, UpstreamErrorKind::Transient, format!("stream error: {e}")));
                        }
                        tracing::warn!(model = %req.model, "SSE stream error after partial data: {e}");
                        return Ok(());
                    }
                    None => {
                        if !received_any {
                            return Err(upstream_err(&req.model, UpstreamErrorKind::Permanent, "stream ended without data"));
                        }
                        tracing::warn!(model = %req.model, "stream ended without terminal marker");
                        return Ok(());
                    }
                },
            }
        }
    }
}

fn delta_len(delta: &StreamDelta) -> usize {
    match delta {
        StreamDelta::Content(s) | StreamDelta::Reasoning(s) => s.len(),
        StreamDelta::Done { .. } => 0,
    }
}

fn parse_frame(data: &str) -> ParsedFrame {
    if data.trim() == "[DONE]" {
        return ParsedFrame::Done { prompt_tokens: None, completion_tokens: None };
    }

    let Ok(chunk) = serde_json::from_str::<StreamChunk>(data) else {
        return ParsedFrame::Skip;
    };

    if let Some(usage) = &chunk.usage
        && chunk.choices.is_empty()
    {
        return ParsedFrame::Done {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        };
    }

    let Some(choice) = chunk.choices.first() else {
        return ParsedFrame::Skip;
    };

    if let Some(ref reasoning) = choice.delta.reasoning_content
        && !reasoning.is_empty()
    {
        return ParsedFrame::Delta(StreamDelta::Reasoning(reasoning.clone()));
    }
    if let Some(ref content) = choice.delta.content
        && !content.is_empty()
    {
        return ParsedFrame::Delta(StreamDelta::Content(content.clone()));
    }

    ParsedFrame::Skip
}

fn classify_status(status: u16) -> UpstreamErrorKind {
    match status {
        // 429 is deliberately NOT retried here: the spec treats upstream-level
        // rate limits as a permanent failure of that model for this call.
        500..=599 => UpstreamErrorKind::Transient,
        _ => UpstreamErrorKind::Permanent,
    }
}

fn upstream_err(model: &str, kind: UpstreamErrorKind, message: impl Into<String>) -> CouncilError {
    CouncilError::Upstream { model: model.to_string(), kind, message: message.into() }
}

