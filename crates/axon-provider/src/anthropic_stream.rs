//! Anthropic SSE stream accumulator.
//!
//! Assembles content-block deltas into completed records: text deltas pass
//! through, thinking deltas become thought-summary updates, and tool-use
//! blocks accumulate `input_json_delta` fragments until `content_block_stop`
//! emits exactly one completed tool call.
//!
//! Some block starts carry a pre-populated `input` snapshot with no deltas
//! to follow; others send an empty snapshot and stream the real arguments
//! as fragments. The local fragment buffer is authoritative whenever at
//! least one fragment was observed — snapshots are only trusted when no
//! fragment arrived. This rule is load-bearing; see the conflict tests.

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use axon_core::types::ToolCall;

use crate::adapt::parse_tool_args;
use crate::stream::{parse_sse_line, SseParsed, StreamEvent};

/// Per-stream accumulation state. Confined to a single stream.
#[derive(Default)]
pub struct StreamState {
    current_event: String,
    current_block_type: String,
    tool_use_id: String,
    tool_use_name: String,
    tool_use_input_json: String,
    /// `input` object carried on the tool_use block start, if any.
    tool_use_snapshot: Option<serde_json::Value>,
    /// Whether any input_json_delta fragment was observed for this block.
    saw_input_delta: bool,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub stop_reason: String,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one SSE line; returns an event to emit, if any.
    pub fn feed_line(&mut self, line: &str) -> Option<StreamEvent> {
        match parse_sse_line(line)? {
            SseParsed::Event(ev) => {
                self.current_event = ev;
                None
            }
            SseParsed::Data(data) => {
                let event_type = self.current_event.clone();
                self.handle_data(&event_type, &data)
            }
        }
    }

    fn handle_data(&mut self, event_type: &str, data: &str) -> Option<StreamEvent> {
        match event_type {
            "message_start" => {
                if let Ok(msg) = serde_json::from_str::<MessageStart>(data) {
                    self.model = msg.message.model;
                    self.tokens_in = msg.message.usage.input_tokens;
                }
                None
            }

            "content_block_start" => {
                if let Ok(start) = serde_json::from_str::<ContentBlockStart>(data) {
                    self.current_block_type = start.content_block.block_type.clone();
                    if start.content_block.block_type == "tool_use" {
                        self.tool_use_id = start.content_block.id.unwrap_or_default();
                        self.tool_use_name = start.content_block.name.unwrap_or_default();
                        self.tool_use_snapshot = start.content_block.input;
                        self.tool_use_input_json.clear();
                        self.saw_input_delta = false;
                    }
                }
                None
            }

            "content_block_delta" => {
                let delta = serde_json::from_str::<ContentBlockDelta>(data).ok()?;
                match delta.delta.delta_type.as_str() {
                    "text_delta" => delta.delta.text.map(|text| {
                        debug!(len = text.len(), "stream text delta");
                        StreamEvent::TextDelta { text }
                    }),
                    "thinking_delta" => delta.delta.thinking.map(|text| {
                        debug!(len = text.len(), "stream thinking delta");
                        StreamEvent::ThoughtDelta { text }
                    }),
                    "input_json_delta" => {
                        if let Some(partial) = delta.delta.partial_json {
                            self.tool_use_input_json.push_str(&partial);
                            self.saw_input_delta = true;
                        }
                        None
                    }
                    other => {
                        debug!(delta_type = other, "unhandled delta type");
                        None
                    }
                }
            }

            "content_block_stop" => {
                if self.current_block_type != "tool_use" {
                    self.current_block_type.clear();
                    return None;
                }
                let args = self.resolve_tool_args();
                let event = StreamEvent::ToolCallDone {
                    call: ToolCall::new(
                        std::mem::take(&mut self.tool_use_id),
                        std::mem::take(&mut self.tool_use_name),
                        args,
                    ),
                };
                self.tool_use_input_json.clear();
                self.tool_use_snapshot = None;
                self.saw_input_delta = false;
                self.current_block_type.clear();
                Some(event)
            }

            "message_delta" => {
                if let Ok(delta) = serde_json::from_str::<MessageDelta>(data) {
                    self.tokens_out = delta.usage.output_tokens;
                    if let Some(reason) = delta.delta.stop_reason {
                        self.stop_reason = reason;
                    }
                }
                None
            }

            "error" => {
                warn!(data, "anthropic stream error");
                Some(StreamEvent::Error {
                    message: data.to_string(),
                })
            }

            // message_stop and unknown events — no action needed
            _ => None,
        }
    }

    /// Pick the argument source for the closing tool_use block.
    /// Fragments win over the snapshot whenever any fragment arrived.
    fn resolve_tool_args(&mut self) -> serde_json::Value {
        if self.saw_input_delta {
            return parse_tool_args(&self.tool_use_input_json);
        }
        match self.tool_use_snapshot.take() {
            Some(snapshot) if snapshot.is_object() => snapshot,
            _ => parse_tool_args(&self.tool_use_input_json),
        }
    }
}

/// Parse an Anthropic streaming SSE response and emit StreamEvents.
/// Reads from a reqwest byte stream, parses SSE lines, emits events.
pub async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut state = StreamState::new();
    let mut line_buf = String::new();
    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };

        // SSE: multiple lines per chunk, keep the incomplete last line buffered.
        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(event) = state.feed_line(line) {
                if tx.send(event).await.is_err() {
                    return; // receiver dropped
                }
            }
        }

        line_buf = remainder;
    }

    let _ = tx
        .send(StreamEvent::Done {
            model: state.model,
            tokens_in: state.tokens_in,
            tokens_out: state.tokens_out,
            stop_reason: state.stop_reason,
        })
        .await;
}

// Anthropic SSE data types (private — deserialization only)

#[derive(Deserialize)]
struct MessageStart {
    message: MessageStartInner,
}

#[derive(Deserialize)]
struct MessageStartInner {
    model: String,
    usage: InputUsage,
}

#[derive(Deserialize)]
struct InputUsage {
    input_tokens: u32,
}

#[derive(Deserialize)]
struct ContentBlockStart {
    content_block: ContentBlockMeta,
}

#[derive(Deserialize)]
struct ContentBlockMeta {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
    /// Pre-populated input snapshot on tool_use starts.
    input: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    delta: DeltaContent,
}

#[derive(Deserialize)]
struct DeltaContent {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
    thinking: Option<String>,
    partial_json: Option<String>,
}

#[derive(Deserialize)]
struct MessageDelta {
    delta: MessageDeltaInner,
    usage: OutputUsage,
}

#[derive(Deserialize)]
struct MessageDeltaInner {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct OutputUsage {
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(state: &mut StreamState, lines: &[&str]) -> Vec<StreamEvent> {
        lines
            .iter()
            .filter_map(|line| state.feed_line(line))
            .collect()
    }

    #[test]
    fn text_deltas_pass_through() {
        let mut state = StreamState::new();
        let events = feed(
            &mut state,
            &[
                "event: content_block_start",
                r#"data: {"content_block":{"type":"text"}}"#,
                "event: content_block_delta",
                r#"data: {"delta":{"type":"text_delta","text":"hi"}}"#,
            ],
        );
        assert!(matches!(&events[0], StreamEvent::TextDelta { text } if text == "hi"));
    }

    #[test]
    fn tool_call_accumulates_fragments() {
        let mut state = StreamState::new();
        let events = feed(
            &mut state,
            &[
                "event: content_block_start",
                r#"data: {"content_block":{"type":"tool_use","id":"call_1","name":"lookup"}}"#,
                "event: content_block_delta",
                r#"data: {"delta":{"type":"input_json_delta","partial_json":"{\"q\":"}}"#,
                "event: content_block_delta",
                r#"data: {"delta":{"type":"input_json_delta","partial_json":"\"rust\"}"}}"#,
                "event: content_block_stop",
                "data: {}",
            ],
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::ToolCallDone { call } => {
                assert_eq!(call.id, "call_1");
                assert_eq!(call.args, serde_json::json!({"q": "rust"}));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn fragments_win_over_empty_snapshot() {
        // Block start carries an empty snapshot, real args arrive as deltas.
        let mut state = StreamState::new();
        let events = feed(
            &mut state,
            &[
                "event: content_block_start",
                r#"data: {"content_block":{"type":"tool_use","id":"c","name":"t","input":{}}}"#,
                "event: content_block_delta",
                r#"data: {"delta":{"type":"input_json_delta","partial_json":"{\"a\":1}"}}"#,
                "event: content_block_stop",
                "data: {}",
            ],
        );
        match &events[0] {
            StreamEvent::ToolCallDone { call } => {
                assert_eq!(call.args, serde_json::json!({"a": 1}));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn snapshot_used_when_no_fragments_arrive() {
        let mut state = StreamState::new();
        let events = feed(
            &mut state,
            &[
                "event: content_block_start",
                r#"data: {"content_block":{"type":"tool_use","id":"c","name":"t","input":{"x":2}}}"#,
                "event: content_block_stop",
                "data: {}",
            ],
        );
        match &events[0] {
            StreamEvent::ToolCallDone { call } => {
                assert_eq!(call.args, serde_json::json!({"x": 2}));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn malformed_fragments_yield_empty_object() {
        let mut state = StreamState::new();
        let events = feed(
            &mut state,
            &[
                "event: content_block_start",
                r#"data: {"content_block":{"type":"tool_use","id":"c","name":"t"}}"#,
                "event: content_block_delta",
                r#"data: {"delta":{"type":"input_json_delta","partial_json":"{\"broken"}}"#,
                "event: content_block_stop",
                "data: {}",
            ],
        );
        match &events[0] {
            StreamEvent::ToolCallDone { call } => {
                assert_eq!(call.args, serde_json::json!({}));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn thinking_deltas_become_thought_events() {
        let mut state = StreamState::new();
        let events = feed(
            &mut state,
            &[
                "event: content_block_start",
                r#"data: {"content_block":{"type":"thinking"}}"#,
                "event: content_block_delta",
                r#"data: {"delta":{"type":"thinking_delta","thinking":"hmm"}}"#,
            ],
        );
        assert!(matches!(&events[0], StreamEvent::ThoughtDelta { text } if text == "hmm"));
    }

    #[test]
    fn usage_and_stop_reason_tracked() {
        let mut state = StreamState::new();
        feed(
            &mut state,
            &[
                "event: message_start",
                r#"data: {"message":{"model":"claude-sonnet-4-5","usage":{"input_tokens":12}}}"#,
                "event: message_delta",
                r#"data: {"delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":34}}"#,
            ],
        );
        assert_eq!(state.model, "claude-sonnet-4-5");
        assert_eq!(state.tokens_in, 12);
        assert_eq!(state.tokens_out, 34);
        assert_eq!(state.stop_reason, "end_turn");
    }
}
