//! Cross-driver streaming behavior: every handler sees at most one
//! completed event per logical tool call, and its args always parse as a
//! JSON object.

use axon_core::types::{Message, ToolCall};
use axon_provider::mock::ScriptedStreamProvider;
use axon_provider::{collect_stream, ChatProvider, ChatRequest, StreamEvent};
use tokio::sync::mpsc;

fn tool_event(id: &str, name: &str, args: serde_json::Value) -> StreamEvent {
    StreamEvent::ToolCallDone {
        call: ToolCall::new(id, name, args),
    }
}

fn done_event() -> StreamEvent {
    StreamEvent::Done {
        model: "scripted".into(),
        tokens_in: 1,
        tokens_out: 2,
        stop_reason: "tool_use".into(),
    }
}

#[tokio::test]
async fn every_tool_call_event_carries_a_json_object() {
    let provider = ScriptedStreamProvider::new(vec![vec![
        StreamEvent::TextDelta {
            text: "let me check".into(),
        },
        tool_event("call_1", "search", serde_json::json!({"q": "rust"})),
        tool_event("call_2", "read", serde_json::json!({})),
        done_event(),
    ]]);

    let (tx, mut rx) = mpsc::channel(16);
    let req = ChatRequest::new("scripted", vec![Message::user("go")]);
    provider.chat_stream(&req, tx).await.unwrap();

    let mut tool_events = 0;
    while let Some(event) = rx.recv().await {
        if let StreamEvent::ToolCallDone { call } = event {
            assert!(call.args.is_object(), "args must be a JSON object");
            tool_events += 1;
        }
    }
    assert_eq!(tool_events, 2);
}

#[tokio::test]
async fn collect_stream_keeps_partial_output_order() {
    let provider = ScriptedStreamProvider::new(vec![vec![
        StreamEvent::TextDelta { text: "a".into() },
        StreamEvent::ThoughtDelta {
            text: "private".into(),
        },
        StreamEvent::TextDelta { text: "b".into() },
        tool_event("call_1", "t", serde_json::json!({"k": 1})),
        done_event(),
    ]]);

    let (tx, rx) = mpsc::channel(16);
    let req = ChatRequest::new("scripted", vec![Message::user("go")]);
    provider.chat_stream(&req, tx).await.unwrap();

    let (msg, stats) = collect_stream(rx).await.unwrap();
    assert_eq!(msg.content, "ab");
    assert_eq!(msg.tool_calls.len(), 1);
    assert_eq!(stats.stop_reason, "tool_use");
}

#[tokio::test]
async fn stream_error_is_terminal_for_collectors() {
    let provider = ScriptedStreamProvider::new(vec![vec![
        StreamEvent::TextDelta {
            text: "partial".into(),
        },
        StreamEvent::Error {
            message: "connection reset".into(),
        },
    ]]);

    let (tx, rx) = mpsc::channel(16);
    let req = ChatRequest::new("scripted", vec![Message::user("go")]);
    provider.chat_stream(&req, tx).await.unwrap();

    assert!(collect_stream(rx).await.is_err());
}
