//! Integration tests for the Upstream Client (§4.1) against a raw TCP mock
//! server speaking HTTP/SSE, in the style of squall's `tests/streaming.rs`.

use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use council::upstream::client::UpstreamClient;
use council::upstream::{ChatMessage, CompletionRequest, StreamDelta};

async fn mock_listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock listener");
    let addr = listener.local_addr().expect("local addr");
    (listener, format!("http://{addr}/v1/chat/completions"))
}

fn sse_response(body_frames: &[&str]) -> Vec<u8> {
    let mut body = String::new();
    for frame in body_frames {
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

async fn serve_once(listener: TcpListener, response: Vec<u8>) {
    let (mut socket, _) = listener.accept().await.expect("accept");
    let mut buf = [0u8; 4096];
    // Drain the request so the client's write doesn't block; ignore content.
    let _ = socket.read(&mut buf).await;
    socket.write_all(&response).await.expect("write response");
    socket.flush().await.ok();
}

fn make_req(model: &str) -> CompletionRequest {
    CompletionRequest {
        model: model.to_string(),
        messages: vec![ChatMessage { role: "user", content: "hi".to_string() }],
        max_tokens: Some(256),
        temperature: None,
        reasoning_effort: None,
        deadline: Instant::now() + Duration::from_secs(5),
        cancellation_token: CancellationToken::new(),
    }
}

#[tokio::test]
async fn streaming_complete_response_forwards_deltas_then_done() {
    let (listener, url) = mock_listener().await;
    let response = sse_response(&[
        r#"{"choices":[{"delta":{"content":"He"}}]}"#,
        r#"{"choices":[{"delta":{"content":"llo"}}]}"#,
        r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":2}}"#,
        "[DONE]",
    ]);
    let server = tokio::spawn(serve_once(listener, response));

    let client = UpstreamClient::new(url, "test-key".to_string());
    let req = make_req("m1");
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);

    client.complete_streaming(&req, tx).await.expect("stream completes");
    server.await.expect("server task");

    let mut content = String::new();
    let mut saw_done = false;
    while let Some(delta) = rx.recv().await {
        match delta {
            StreamDelta::Content(s) => content.push_str(&s),
            StreamDelta::Done { completion_tokens, .. } => {
                saw_done = true;
                assert_eq!(completion_tokens, Some(2));
            }
            StreamDelta::Reasoning(_) => panic!("unexpected reasoning delta"),
        }
    }

    assert_eq!(content, "Hello");
    assert!(saw_done);
}

#[tokio::test]
async fn streaming_skips_malformed_frames() {
    let (listener, url) = mock_listener().await;
    let response = sse_response(&[
        "not json at all",
        r#"{"choices":[{"delta":{"content":"ok"}}]}"#,
        "[DONE]",
    ]);
    let server = tokio::spawn(serve_once(listener, response));

    let client = UpstreamClient::new(url, "test-key".to_string());
    let req = make_req("m1");
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);

    client.complete_streaming(&req, tx).await.expect("stream completes despite malformed frame");
    server.await.expect("server task");

    let mut content = String::new();
    while let Some(delta) = rx.recv().await {
        if let StreamDelta::Content(s) = delta {
            content.push_str(&s);
        }
    }
    assert_eq!(content, "ok");
}

#[tokio::test]
async fn streaming_cancellation_returns_ok_with_partial_forwarded() {
    let (listener, url) = mock_listener().await;
    let response = sse_response(&[r#"{"choices":[{"delta":{"content":"partial"}}]}"#]);
    let server = tokio::spawn(serve_once(listener, response));

    let client = UpstreamClient::new(url, "test-key".to_string());
    let mut req = make_req("m1");
    let cancel = CancellationToken::new();
    req.cancellation_token = cancel.clone();
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);

    let call = tokio::spawn(async move { client.complete_streaming(&req, tx).await });
    // Give the mock server time to deliver the first frame before cancelling.
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let result = call.await.expect("task joins");
    assert!(result.is_ok());
    server.await.expect("server task");

    let mut saw_content = false;
    while let Some(delta) = rx.recv().await {
        if let StreamDelta::Content(s) = delta {
            assert_eq!(s, "partial");
            saw_content = true;
        }
    }
    assert!(saw_content);
}

#[tokio::test]
async fn streaming_cancellation_before_headers_arrive_returns_promptly() {
    let (listener, url) = mock_listener().await;
    // Accept the connection but never write a response — the upstream is
    // stalled before sending headers.
    let server = tokio::spawn(async move {
        let (_socket, _) = listener.accept().await.expect("accept");
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let client = UpstreamClient::new(url, "test-key".to_string());
    let mut req = make_req("m1");
    let cancel = CancellationToken::new();
    req.cancellation_token = cancel.clone();
    let (tx, _rx) = tokio::sync::mpsc::channel(16);

    let call = tokio::spawn(async move { client.complete_streaming(&req, tx).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(1), call)
        .await
        .expect("cancellation must not wait out the headers timeout")
        .expect("task joins");
    assert!(result.is_err(), "a stalled upstream cancelled before headers arrive must fail, not hang");
    server.abort();
}

#[tokio::test]
async fn blocking_completion_parses_full_response() {
    let (listener, url) = mock_listener().await;
    let body = r#"{"choices":[{"message":{"content":"the answer"}}],"usage":{"prompt_tokens":5,"completion_tokens":3}}"#;
    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes();
    let server = tokio::spawn(serve_once(listener, response));

    let client = UpstreamClient::new(url, "test-key".to_string());
    let req = make_req("m1");
    let result = client.complete_blocking(&req).await.expect("blocking call succeeds");
    server.await.expect("server task");

    assert_eq!(result.text, "the answer");
    assert_eq!(result.completion_tokens, Some(3));
}

fn error_response(status: u16) -> Vec<u8> {
    format!("HTTP/1.1 {status} Upstream Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n").into_bytes()
}

async fn serve_sequence(listener: TcpListener, responses: Vec<Vec<u8>>) {
    for response in responses {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut buf = [0u8; 4096];
        let _ = socket.read(&mut buf).await;
        socket.write_all(&response).await.expect("write response");
        socket.flush().await.ok();
    }
}

#[tokio::test]
async fn blocking_completion_retries_transient_failures_then_succeeds() {
    let (listener, url) = mock_listener().await;
    let body = r#"{"choices":[{"message":{"content":"third time lucky"}}]}"#;
    let success = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes();
    // Two transient (5xx) failures, then success: the spec allows up to two
    // retries (1s, then 2s backoff) before giving up.
    let server = tokio::spawn(serve_sequence(listener, vec![error_response(503), error_response(500), success]));

    let client = UpstreamClient::new(url, "test-key".to_string());
    let req = make_req("m1");
    let result = client.complete_blocking(&req).await.expect("succeeds after two retries");
    server.await.expect("server task");

    assert_eq!(result.text, "third time lucky");
}

#[tokio::test]
async fn blocking_completion_does_not_retry_permanent_failures() {
    let (listener, url) = mock_listener().await;
    // A single 429 is enough; if the client retried, the server would see a
    // second connection and `serve_sequence` would panic on an empty queue.
    let server = tokio::spawn(serve_sequence(listener, vec![error_response(429)]));

    let client = UpstreamClient::new(url, "test-key".to_string());
    let req = make_req("m1");
    let result = client.complete_blocking(&req).await;
    server.await.expect("server task");

    assert!(result.is_err(), "429 is treated as a permanent failure of this model, not retried");
}

#[tokio::test]
async fn blocking_completion_gives_up_after_exhausting_retries() {
    let (listener, url) = mock_listener().await;
    // Three 5xx responses: the initial attempt plus both retries all fail,
    // so the call must surface the error rather than retry a third time.
    let server = tokio::spawn(serve_sequence(listener, vec![error_response(500), error_response(500), error_response(502)]));

    let client = UpstreamClient::new(url, "test-key".to_string());
    let req = make_req("m1");
    let result = client.complete_blocking(&req).await;
    server.await.expect("server task");

    assert!(result.is_err(), "exhausting both retries must surface the last failure");
}
