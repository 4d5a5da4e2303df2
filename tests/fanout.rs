//! Integration tests for the Parallel Streaming Fan-Out (§4.2): concurrent
//! per-model deltas merged into one channel, and tolerance of one model's
//! upstream failure while others continue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use council::fanout::{fan_out, FanoutEvent};
use council::upstream::client::UpstreamClient;
use council::upstream::{ChatMessage, CompletionRequest};

fn sse_body(frames: &[&str]) -> Vec<u8> {
    let mut body = String::new();
    for frame in frames {
        body.push_str("data: ");
        body.push_str(frame);
        body.push_str("\n\n");
    }
    format!(
        "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\nconnection: close\r\n\r\n{:x}\r\n{}\r\n0\r\n\r\n",
        body.len(),
        body
    )
    .into_bytes()
}

fn error_response(status: u16) -> Vec<u8> {
    format!("HTTP/1.1 {status} Upstream Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n").into_bytes()
}

fn extract_model(text: &str) -> Option<String> {
    let needle = "\"model\":\"";
    let start = text.find(needle)? + needle.len();
    let end = text[start..].find('"')?;
    Some(text[start..start + end].to_string())
}

async fn run_mock_gateway(listener: TcpListener, scripts: Arc<AsyncMutex<HashMap<String, VecDeque<Vec<u8>>>>>, total_requests: usize) {
    for _ in 0..total_requests {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let scripts = Arc::clone(&scripts);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 16384];
            let n = socket.read(&mut buf).await.unwrap_or(0);
            let text = String::from_utf8_lossy(&buf[..n]);
            let model = extract_model(&text).unwrap_or_default();
            let response = {
                let mut guard = scripts.lock().await;
                guard.get_mut(&model).and_then(|q| q.pop_front()).unwrap_or_else(|| error_response(500))
            };
            let _ = socket.write_all(&response).await;
            let _ = socket.flush().await;
        });
    }
}

fn make_req(model: &str, deadline_secs: u64, cancel: CancellationToken) -> CompletionRequest {
    CompletionRequest {
        model: model.to_string(),
        messages: vec![ChatMessage { role: "user", content: "hi".to_string() }],
        max_tokens: Some(256),
        temperature: None,
        reasoning_effort: None,
        deadline: Instant::now() + Duration::from_secs(deadline_secs),
        cancellation_token: cancel,
    }
}

#[tokio::test]
async fn one_model_failing_does_not_stop_the_others() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let base_url = format!("http://{}", listener.local_addr().unwrap());

    let mut scripts: HashMap<String, VecDeque<Vec<u8>>> = HashMap::new();
    scripts.insert(
        "good".to_string(),
        VecDeque::from([sse_body(&[
            r#"{"choices":[{"delta":{"content":"A1"}}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":1,"completion_tokens":1}}"#,
            "[DONE]",
        ])]),
    );
    scripts.insert("bad".to_string(), VecDeque::from([error_response(500)]));
    let scripts = Arc::new(AsyncMutex::new(scripts));
    let gateway = tokio::spawn(run_mock_gateway(listener, scripts, 2));

    let client = Arc::new(UpstreamClient::new(base_url, "test-key".to_string()));
    let cancel = CancellationToken::new();
    let requests = vec![
        ("good".to_string(), make_req("good", 5, cancel.clone())),
        ("bad".to_string(), make_req("bad", 5, cancel.clone())),
    ];

    let mut rx = fan_out(client, requests);
    let mut content = HashMap::new();
    let mut saw_done_for = Vec::new();
    while let Some(event) = rx.recv().await {
        match event {
            FanoutEvent::Delta { model, delta } => {
                content.entry(model).or_insert_with(String::new).push_str(&delta);
            }
            FanoutEvent::Done { model, .. } => saw_done_for.push(model),
        }
    }
    gateway.await.expect("gateway task");

    assert_eq!(content.get("good").map(String::as_str), Some("A1"));
    assert!(!content.contains_key("bad"), "a model that never streamed anything contributes no deltas");
    assert_eq!(saw_done_for, vec!["good".to_string()], "only the succeeding model gets a terminal event");
}

#[tokio::test]
async fn per_model_delta_order_is_preserved_and_terminal_follows_deltas() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let base_url = format!("http://{}", listener.local_addr().unwrap());

    let mut scripts: HashMap<String, VecDeque<Vec<u8>>> = HashMap::new();
    scripts.insert(
        "m".to_string(),
        VecDeque::from([sse_body(&[
            r#"{"choices":[{"delta":{"content":"one "}}]}"#,
            r#"{"choices":[{"delta":{"content":"two "}}]}"#,
            r#"{"choices":[{"delta":{"content":"three"}}]}"#,
            "[DONE]",
        ])]),
    );
    let scripts = Arc::new(AsyncMutex::new(scripts));
    let gateway = tokio::spawn(run_mock_gateway(listener, scripts, 1));

    let client = Arc::new(UpstreamClient::new(base_url, "test-key".to_string()));
    let cancel = CancellationToken::new();
    let requests = vec![("m".to_string(), make_req("m", 5, cancel))];

    let mut rx = fan_out(client, requests);
    let mut deltas = Vec::new();
    let mut terminal_seen = false;
    while let Some(event) = rx.recv().await {
        match event {
            FanoutEvent::Delta { delta, .. } => {
                assert!(!terminal_seen, "no delta may arrive after the terminal event for its model");
                deltas.push(delta);
            }
            FanoutEvent::Done { .. } => terminal_seen = true,
        }
    }
    gateway.await.expect("gateway task");

    assert_eq!(deltas.join(""), "one two three");
    assert!(terminal_seen);
}
