use axon_core::types::{ImageData, Message, Role, ToolCall};

use crate::provider::ProviderError;

/// Events emitted during a streaming model response.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental visible text from the model.
    TextDelta { text: String },

    /// Incremental thought-summary content from reasoning-capable backends.
    /// Never shown to end users directly — callers decide how to surface it.
    ThoughtDelta { text: String },

    /// A fully accumulated tool call. Emitted at most once per logical call;
    /// `call.args` always parses as a JSON object.
    ToolCallDone { call: ToolCall },

    /// An image generated by the model.
    Image { image: ImageData },

    /// Stream completed successfully.
    Done {
        model: String,
        tokens_in: u32,
        tokens_out: u32,
        stop_reason: String,
    },

    /// Error during streaming. Terminal.
    Error { message: String },
}

/// Parse a single SSE line.
/// SSE format: `event: <type>\ndata: <json>\n\n`
pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(event_type) = line.strip_prefix("event: ") {
        Some(SseParsed::Event(event_type.to_string()))
    } else {
        line.strip_prefix("data: ")
            .map(|data| SseParsed::Data(data.to_string()))
    }
}

#[derive(Debug)]
pub enum SseParsed {
    Event(String),
    Data(String),
}

/// Usage and termination metadata from a completed stream.
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub stop_reason: String,
}

/// Drain a stream-event channel into a completed assistant message.
///
/// Convenience for callers that want streaming transport but a blocking
/// result. Partial output already received is kept when the stream ends in
/// an error — the error wins, matching the terminal-event guarantee.
pub async fn collect_stream(
    rx: tokio::sync::mpsc::Receiver<StreamEvent>,
) -> Result<(Message, StreamStats), ProviderError> {
    use tokio_stream::{wrappers::ReceiverStream, StreamExt};

    let mut stream = ReceiverStream::new(rx);
    let mut msg = Message::new(Role::Assistant, "");
    let mut thought = String::new();
    let mut stats = StreamStats::default();

    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::TextDelta { text } => msg.content.push_str(&text),
            StreamEvent::ThoughtDelta { text } => thought.push_str(&text),
            StreamEvent::ToolCallDone { call } => msg.tool_calls.push(call),
            StreamEvent::Image { image } => msg.images.push(image),
            StreamEvent::Done {
                model,
                tokens_in,
                tokens_out,
                stop_reason,
            } => {
                stats = StreamStats {
                    model,
                    tokens_in,
                    tokens_out,
                    stop_reason,
                };
                return Ok((msg, stats));
            }
            StreamEvent::Error { message } => {
                return Err(ProviderError::Parse(message));
            }
        }
    }

    // Channel closed without a terminal event — treat as completed if any
    // content arrived, otherwise the stream produced nothing at all.
    if msg.content.is_empty() && msg.tool_calls.is_empty() && thought.is_empty() {
        return Err(ProviderError::Parse(
            "stream ended without content or terminal event".to_string(),
        ));
    }
    Ok((msg, stats))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_and_data_lines() {
        match parse_sse_line("event: message_start") {
            Some(SseParsed::Event(e)) => assert_eq!(e, "message_start"),
            other => panic!("unexpected: {other:?}"),
        }
        match parse_sse_line("data: {\"x\":1}") {
            Some(SseParsed::Data(d)) => assert_eq!(d, "{\"x\":1}"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(parse_sse_line(": comment").is_none());
    }

    #[tokio::test]
    async fn collect_assembles_message_and_stats() {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        tx.send(StreamEvent::TextDelta { text: "hel".into() })
            .await
            .unwrap();
        tx.send(StreamEvent::TextDelta { text: "lo".into() })
            .await
            .unwrap();
        tx.send(StreamEvent::ToolCallDone {
            call: ToolCall::new("call_1", "lookup", serde_json::json!({})),
        })
        .await
        .unwrap();
        tx.send(StreamEvent::Done {
            model: "m".into(),
            tokens_in: 3,
            tokens_out: 7,
            stop_reason: "end_turn".into(),
        })
        .await
        .unwrap();
        drop(tx);

        let (msg, stats) = collect_stream(rx).await.unwrap();
        assert_eq!(msg.content, "hello");
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(stats.tokens_out, 7);
    }

    #[tokio::test]
    async fn collect_surfaces_stream_error() {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        tx.send(StreamEvent::Error {
            message: "boom".into(),
        })
        .await
        .unwrap();
        drop(tx);

        assert!(collect_stream(rx).await.is_err());
    }
}
