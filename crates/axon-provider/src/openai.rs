use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use axon_core::types::{synthesize_call_id, Message, Role, ToolCall};

use crate::adapt::{ensure_tool_response_ids, parse_tool_args, tool_response_body};
use crate::extras::{apply_extras, merge_extras};
use crate::provider::{retry_after_ms, ChatProvider, ChatRequest, ProviderError};
use crate::stream::{parse_sse_line, SseParsed, StreamEvent};

/// OpenAI chat-completions driver (function-calling provider).
///
/// Also serves OpenAI-compatible backends through `with_path` — the wire
/// format is the de-facto standard for hosted open-weight models.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    provider_name: String,
    chat_path: String,
    extra_params: serde_json::Map<String, serde_json::Value>,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self::with_path(
            "openai",
            api_key,
            base_url.unwrap_or_else(|| "https://api.openai.com".to_string()),
            "/v1/chat/completions".to_string(),
        )
    }

    /// Named OpenAI-compatible provider with a custom endpoint path.
    /// `base_url` without trailing slash; `chat_path` starting with "/".
    pub fn with_path(
        name: impl Into<String>,
        api_key: String,
        base_url: String,
        chat_path: String,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            provider_name: name.into(),
            api_key,
            base_url,
            chat_path,
            extra_params: serde_json::Map::new(),
        }
    }

    pub fn with_extra_params(mut self, extras: serde_json::Map<String, serde_json::Value>) -> Self {
        self.extra_params = extras;
        self
    }

    async fn post(
        &self,
        body: &serde_json::Value,
        model: &str,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}{}", self.base_url, self.chat_path);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            return Err(ProviderError::RateLimited {
                retry_after_ms: retry_after_ms(&resp),
            });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "OpenAI API error");
            return Err(ProviderError::Api {
                status,
                message: text,
                model: model.to_string(),
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn chat(&self, req: &ChatRequest) -> Result<Message, ProviderError> {
        let body = build_request_body(req, &self.extra_params, false);
        debug!(model = %req.model, "sending request to OpenAI");

        let resp = self.post(&body, &req.model).await?;
        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(parse_response(api_resp))
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let body = build_request_body(req, &self.extra_params, true);
        debug!(model = %req.model, "sending streaming request to OpenAI");

        let resp = self.post(&body, &req.model).await?;
        process_stream(resp, req.model.clone(), tx).await;
        Ok(())
    }
}

pub(crate) fn build_request_body(
    req: &ChatRequest,
    client_extras: &serde_json::Map<String, serde_json::Value>,
    stream: bool,
) -> serde_json::Value {
    let messages = ensure_tool_response_ids(&req.messages);
    let wire_messages: Vec<serde_json::Value> = messages.iter().map(adapt_message).collect();

    let mut body = serde_json::json!({
        "model": req.model,
        "messages": wire_messages,
        "max_tokens": req.max_tokens,
        "stream": stream,
    });

    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
        body["tools"] = serde_json::json!(tools);
    }

    let extras = merge_extras(client_extras, &req.extra_params, !req.tools.is_empty());
    apply_extras(&mut body, &extras);
    body
}

fn adapt_message(msg: &Message) -> serde_json::Value {
    match msg.role {
        Role::Assistant if msg.has_tool_calls() => {
            let tool_calls: Vec<serde_json::Value> = msg
                .tool_calls
                .iter()
                .map(|call| {
                    serde_json::json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": call.args.to_string(),
                        }
                    })
                })
                .collect();
            let content = if msg.content.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::json!(msg.content)
            };
            serde_json::json!({
                "role": "assistant",
                "content": content,
                "tool_calls": tool_calls,
            })
        }
        Role::Tool => serde_json::json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.as_deref().unwrap_or_default(),
            "content": tool_response_body(&msg.content),
        }),
        Role::User if !msg.images.is_empty() => {
            let mut parts = vec![serde_json::json!({"type": "text", "text": msg.content})];
            for img in &msg.images {
                parts.push(serde_json::json!({
                    "type": "image_url",
                    "image_url": {
                        "url": format!("data:{};base64,{}", img.mime_type, img.data),
                    }
                }));
            }
            serde_json::json!({"role": "user", "content": parts})
        }
        _ => serde_json::json!({
            "role": msg.role.to_string(),
            "content": msg.content,
        }),
    }
}

pub(crate) fn parse_response(resp: ApiResponse) -> Message {
    let choice = resp.choices.into_iter().next();
    let content = choice
        .as_ref()
        .and_then(|c| c.message.content.as_deref())
        .unwrap_or("")
        .to_string();

    let tool_calls: Vec<ToolCall> = choice
        .as_ref()
        .and_then(|c| c.message.tool_calls.as_ref())
        .map(|calls| {
            calls
                .iter()
                .map(|tc| {
                    let id = if tc.id.is_empty() {
                        synthesize_call_id()
                    } else {
                        tc.id.clone()
                    };
                    ToolCall::new(id, tc.function.name.clone(), parse_tool_args(&tc.function.arguments))
                })
                .collect()
        })
        .unwrap_or_default();

    Message::assistant(content).with_tool_calls(tool_calls)
}

/// Fragmentary tool call assembled from streamed deltas, keyed by index.
#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    args_buf: String,
}

/// Parse an OpenAI streaming SSE response and emit StreamEvents.
///
/// Tool-call arguments arrive as fragments spread over many chunks, keyed
/// by a per-call index; they are buffered and emitted as completed calls
/// when the stream finishes (finish_reason or `[DONE]`).
pub(crate) async fn process_stream(
    resp: reqwest::Response,
    model: String,
    tx: mpsc::Sender<StreamEvent>,
) {
    use futures_util::StreamExt;

    let mut tokens_in: u32 = 0;
    let mut tokens_out: u32 = 0;
    let mut stop_reason = String::new();
    let mut line_buf = String::new();
    let mut partial_calls: BTreeMap<u32, PartialToolCall> = BTreeMap::new();

    let mut byte_stream = resp.bytes_stream();

    'outer: while let Some(chunk) = byte_stream.next().await {
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

        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(SseParsed::Data(data)) = parse_sse_line(line) {
                if data.trim() == "[DONE]" {
                    break 'outer;
                }

                let Ok(chunk_resp) = serde_json::from_str::<StreamChunk>(&data) else {
                    // Mid-chunk parse failures are logged and skipped.
                    debug!(data, "skipping unparseable stream chunk");
                    continue;
                };

                if let Some(usage) = &chunk_resp.usage {
                    tokens_in = usage.prompt_tokens;
                    tokens_out = usage.completion_tokens;
                }

                for choice in &chunk_resp.choices {
                    if let Some(reason) = &choice.finish_reason {
                        if !reason.is_empty() {
                            stop_reason = reason.clone();
                        }
                    }
                    if let Some(content) = &choice.delta.content {
                        if !content.is_empty()
                            && tx
                                .send(StreamEvent::TextDelta {
                                    text: content.clone(),
                                })
                                .await
                                .is_err()
                        {
                            return; // receiver dropped
                        }
                    }
                    for frag in choice.delta.tool_calls.iter().flatten() {
                        let slot = partial_calls.entry(frag.index).or_default();
                        if let Some(id) = &frag.id {
                            slot.id = id.clone();
                        }
                        if let Some(function) = &frag.function {
                            if let Some(name) = &function.name {
                                slot.name.push_str(name);
                            }
                            if let Some(arguments) = &function.arguments {
                                slot.args_buf.push_str(arguments);
                            }
                        }
                    }
                }
            }
        }

        line_buf = remainder;
    }

    // Flush accumulated tool calls — one completed event per logical call.
    for (_, partial) in std::mem::take(&mut partial_calls) {
        let id = if partial.id.is_empty() {
            synthesize_call_id()
        } else {
            partial.id
        };
        let call = ToolCall::new(id, partial.name, parse_tool_args(&partial.args_buf));
        if tx.send(StreamEvent::ToolCallDone { call }).await.is_err() {
            return;
        }
    }

    // Canonical stop reason: "tool_calls" maps to "tool_use".
    if stop_reason == "tool_calls" {
        stop_reason = "tool_use".to_string();
    }

    let _ = tx
        .send(StreamEvent::Done {
            model,
            tokens_in,
            tokens_out,
            stop_reason,
        })
        .await;
}

// OpenAI API response types — pub(crate) so the responses driver can reuse

#[derive(Deserialize)]
pub(crate) struct ApiResponse {
    pub(crate) choices: Vec<Choice>,
}

#[derive(Deserialize)]
pub(crate) struct Choice {
    pub(crate) message: ChatMessage,
}

#[derive(Deserialize)]
pub(crate) struct ChatMessage {
    pub(crate) content: Option<String>,
    pub(crate) tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Deserialize)]
pub(crate) struct ApiToolCall {
    #[serde(default)]
    pub(crate) id: String,
    pub(crate) function: ApiFunction,
}

#[derive(Deserialize)]
pub(crate) struct ApiFunction {
    pub(crate) name: String,
    pub(crate) arguments: String,
}

// OpenAI streaming chunk types

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
    usage: Option<StreamUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCallFragment>>,
}

#[derive(Deserialize)]
struct StreamToolCallFragment {
    index: u32,
    id: Option<String>,
    function: Option<StreamFunctionFragment>,
}

#[derive(Deserialize)]
struct StreamFunctionFragment {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct StreamUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_core::types::ToolSpec;

    #[test]
    fn assistant_tool_calls_serialize_arguments_as_string() {
        let assistant = Message::assistant("").with_tool_calls(vec![ToolCall::new(
            "call_1",
            "calc",
            serde_json::json!({"expr": "1+1"}),
        )]);
        let req = ChatRequest::new("gpt-4o", vec![assistant]);
        let body = build_request_body(&req, &serde_json::Map::new(), false);
        let args = body["messages"][0]["tool_calls"][0]["function"]["arguments"]
            .as_str()
            .unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(args).unwrap(),
            serde_json::json!({"expr": "1+1"})
        );
        assert!(body["messages"][0]["content"].is_null());
    }

    #[test]
    fn tool_message_maps_to_tool_role() {
        let req = ChatRequest::new("gpt-4o", vec![Message::tool("call_9", "ok")]);
        let body = build_request_body(&req, &serde_json::Map::new(), false);
        assert_eq!(body["messages"][0]["role"], "tool");
        assert_eq!(body["messages"][0]["tool_call_id"], "call_9");
    }

    #[test]
    fn parallel_tool_calls_stripped_without_tools() {
        let mut extras = serde_json::Map::new();
        extras.insert("parallel_tool_calls".into(), serde_json::json!(false));

        let req = ChatRequest::new("gpt-4o", vec![Message::user("hi")]);
        let body = build_request_body(&req, &extras, false);
        assert!(body.get("parallel_tool_calls").is_none());

        let with_tools = req.with_tools(vec![ToolSpec {
            name: "t".into(),
            description: "d".into(),
            input_schema: serde_json::json!({"type": "object"}),
        }]);
        let body = build_request_body(&with_tools, &extras, false);
        assert_eq!(body["parallel_tool_calls"], serde_json::json!(false));
    }

    #[test]
    fn missing_call_id_is_synthesized_in_response() {
        let resp = ApiResponse {
            choices: vec![Choice {
                message: ChatMessage {
                    content: None,
                    tool_calls: Some(vec![ApiToolCall {
                        id: String::new(),
                        function: ApiFunction {
                            name: "t".into(),
                            arguments: "{}".into(),
                        },
                    }]),
                },
            }],
        };
        let msg = parse_response(resp);
        assert!(msg.tool_calls[0].id.starts_with("call_"));
    }

    #[test]
    fn malformed_arguments_become_empty_object() {
        let resp = ApiResponse {
            choices: vec![Choice {
                message: ChatMessage {
                    content: None,
                    tool_calls: Some(vec![ApiToolCall {
                        id: "call_1".into(),
                        function: ApiFunction {
                            name: "t".into(),
                            arguments: "{\"bro".into(),
                        },
                    }]),
                },
            }],
        };
        let msg = parse_response(resp);
        assert_eq!(msg.tool_calls[0].args, serde_json::json!({}));
    }
}
