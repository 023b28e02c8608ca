use super::*;
use crate::config::LlmConfig;
use crate::llm::history::ToolCallRequest;
use futures::StreamExt;
use httptest::{Expectation, Server, matchers::*, responders::*};

fn sse(frames: &[&str]) -> String {
    frames.iter().map(|f| format!("data: {f}\n\n")).collect()
}

fn client_for(server: &Server) -> ChatClient {
    ChatClient::new(format!("{}/", server.url_str("")), "test-key", "test/model")
        .unwrap()
        .with_llm_config(LlmConfig {
            connect_timeout_ms: 5_000,
            request_timeout_ms: 5_000,
            read_idle_timeout_ms: 5_000,
            ..LlmConfig::default()
        })
}

fn conversation() -> Conversation {
    let mut c = Conversation::new(Some("sys".into()));
    c.push_user("hi").unwrap();
    c
}

async fn collect(stream: EventStream) -> Vec<Result<StreamEvent, LlmError>> {
    stream.collect().await
}

#[test]
fn decoder_text_then_stop() {
    let mut d = FrameDecoder::new();
    let ev = d
        .push_line(r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#)
        .unwrap();
    assert_eq!(ev, vec![StreamEvent::TextDelta("Hel".into())]);
    d.push_line(r#"data: {"choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}]}"#)
        .unwrap();
    let usage = d
        .push_line(r#"data: {"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":2,"total_tokens":5}}"#)
        .unwrap();
    assert!(matches!(usage[0], StreamEvent::Usage(Usage { total_tokens: 5, .. })));
    d.push_line("data: [DONE]").unwrap();
    assert!(d.is_done());
    assert_eq!(
        d.finish().unwrap(),
        vec![StreamEvent::TurnFinished(FinishReason::Stop)]
    );
}

#[test]
fn decoder_skips_comments_and_event_lines() {
    let mut d = FrameDecoder::new();
    assert!(d.push_line(": OPENROUTER PROCESSING").unwrap().is_empty());
    assert!(d.push_line("event: message").unwrap().is_empty());
    assert!(d.push_line("").unwrap().is_empty());
}

#[test]
fn decoder_malformed_frame_is_transport_error() {
    let mut d = FrameDecoder::new();
    let err = d.push_line("data: {not json").unwrap_err();
    assert!(matches!(err, LlmError::Transport(_)));
}

#[test]
fn decoder_in_stream_error_is_classified() {
    let mut d = FrameDecoder::new();
    let err = d
        .push_line(r#"data: {"error":{"code":429,"message":"slow down"}}"#)
        .unwrap_err();
    match err {
        LlmError::Backend {
            category, message, ..
        } => {
            assert_eq!(category, BackendCategory::RateLimited);
            assert_eq!(message, "slow down");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn decoder_stop_with_calls_becomes_tool_calls() {
    let mut d = FrameDecoder::new();
    d.push_line(r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"browser_open","arguments":"{}"}}]},"finish_reason":"stop"}]}"#)
        .unwrap();
    let ev = d.finish().unwrap();
    assert_eq!(
        ev,
        vec![
            StreamEvent::ToolCallComplete(ToolCallRequest::new("c1", "browser_open", "{}")),
            StreamEvent::TurnFinished(FinishReason::ToolCalls),
        ]
    );
}

#[test]
fn decoder_eof_without_reason_is_transport_error() {
    let mut d = FrameDecoder::new();
    d.push_line(r#"data: {"choices":[{"delta":{"content":"partial"}}]}"#)
        .unwrap();
    assert!(matches!(d.finish(), Err(LlmError::Transport(_))));
}

#[test]
fn decoder_done_after_content_infers_reason() {
    let mut d = FrameDecoder::new();
    d.push_line(r#"data: {"choices":[{"delta":{"content":"answer"}}]}"#)
        .unwrap();
    d.push_line("data: [DONE]").unwrap();
    assert_eq!(
        d.finish().unwrap(),
        vec![StreamEvent::TurnFinished(FinishReason::Stop)]
    );
}

#[test]
fn decoder_length_drops_tool_calls() {
    let mut d = FrameDecoder::new();
    d.push_line(r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"browser_open","arguments":"{\"ur"}}]},"finish_reason":"length"}]}"#)
        .unwrap();
    assert_eq!(
        d.finish().unwrap(),
        vec![StreamEvent::TurnFinished(FinishReason::Length)]
    );
}

#[test]
fn decoder_unknown_reason_drops_tool_calls() {
    let mut d = FrameDecoder::new();
    d.push_line(r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"browser_close","arguments":"{}"}}]},"finish_reason":"recitation"}]}"#)
        .unwrap();
    assert_eq!(
        d.finish().unwrap(),
        vec![StreamEvent::TurnFinished(FinishReason::Other("recitation".into()))]
    );
}

#[tokio::test]
async fn streams_fragmented_tool_call() {
    let server = Server::run();
    let body = sse(&[
        r#"{"choices":[{"delta":{"role":"assistant","content":"Opening"}}]}"#,
        r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"browser_open","arguments":""}}]}}]}"#,
        r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"url\":\"https://"}}]}}]}"#,
        r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"example.com\"}"}}]},"finish_reason":"tool_calls"}]}"#,
        r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":4,"total_tokens":14}}"#,
        "[DONE]",
    ]);
    server.expect(
        Expectation::matching(all_of![
            request::method_path("POST", "/v1/chat/completions"),
            request::headers(contains(key("authorization"))),
            request::headers(contains(key("x-title"))),
            request::body(json_decoded(eq(serde_json::json!({
                "model": "test/model",
                "messages": [
                    {"role": "system", "content": "sys"},
                    {"role": "user", "content": "hi"}
                ],
                "temperature": 0.7,
                "max_tokens": 4096,
                "stream": true,
                "stream_options": {"include_usage": true}
            })))),
        ])
        .respond_with(
            status_code(200)
                .insert_header("Content-Type", "text/event-stream")
                .body(body),
        ),
    );

    let client = client_for(&server);
    let stream = client
        .stream_completion(&conversation(), &[], CancellationToken::new())
        .await
        .unwrap();
    let events: Vec<StreamEvent> = collect(stream)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(events.first(), Some(&StreamEvent::TextDelta("Opening".into())));
    let completes: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ToolCallComplete(c) => Some(c.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        completes,
        vec![ToolCallRequest::new(
            "call_1",
            "browser_open",
            r#"{"url":"https://example.com"}"#
        )]
    );
    assert_eq!(
        events.last(),
        Some(&StreamEvent::TurnFinished(FinishReason::ToolCalls))
    );
}

#[tokio::test]
async fn rate_limit_status_is_backend_error_with_retry_after() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("POST", "/v1/chat/completions")).respond_with(
            status_code(429)
                .append_header("Retry-After", "2")
                .body(r#"{"error":{"message":"Rate limit exceeded","code":429}}"#),
        ),
    );
    let client = client_for(&server);
    let err = match client
        .stream_completion(&conversation(), &[], CancellationToken::new())
        .await
    {
        Ok(_) => panic!("expected error"),
        Err(e) => e,
    };
    match err {
        LlmError::Backend {
            category,
            status,
            message,
            retry_after,
        } => {
            assert_eq!(category, BackendCategory::RateLimited);
            assert_eq!(status, Some(429));
            assert_eq!(message, "Rate limit exceeded");
            assert_eq!(retry_after, Some(2));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn bad_request_is_not_retryable() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("POST", "/v1/chat/completions"))
            .respond_with(status_code(400).body("bad")),
    );
    let client = client_for(&server);
    let err = client
        .stream_completion(&conversation(), &[], CancellationToken::new())
        .await
        .err()
        .unwrap();
    assert!(!err.is_retryable());
    assert!(matches!(
        err,
        LlmError::Backend {
            category: BackendCategory::InvalidRequest,
            ..
        }
    ));
}

#[tokio::test]
async fn truncated_body_yields_transport_error() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("POST", "/v1/chat/completions")).respond_with(
            status_code(200).body(sse(&[r#"{"choices":[{"delta":{"content":"par"}}]}"#])),
        ),
    );
    let client = client_for(&server);
    let stream = client
        .stream_completion(&conversation(), &[], CancellationToken::new())
        .await
        .unwrap();
    let items = collect(stream).await;
    assert!(matches!(items.last(), Some(Err(LlmError::Transport(_)))));
}

#[tokio::test]
async fn cancelled_before_send() {
    let server = Server::run();
    let client = client_for(&server);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = client
        .stream_completion(&conversation(), &[], cancel)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, LlmError::Cancelled));
}

#[tokio::test]
async fn rejects_unpaired_conversation() {
    let server = Server::run();
    let client = client_for(&server);
    let mut c = conversation();
    c.commit_assistant(None, vec![ToolCallRequest::new("a", "browser_close", "{}")])
        .unwrap();
    let err = client
        .stream_completion(&c, &[], CancellationToken::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, LlmError::InvalidConversation(_)));
}

#[test]
fn tool_definitions_go_on_the_wire_in_order() {
    let defs = crate::tools::browser::definitions();
    let wire = wire_tools(&defs);
    let names: Vec<_> = wire.iter().map(|t| t.function.name.as_str()).collect();
    assert_eq!(names[0], "browser_open");
    assert!(wire.iter().all(|t| t.kind == "function"));
}
