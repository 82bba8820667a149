//! OpenAI responses-API driver with provider-native compaction.
//!
//! The responses API replaces the chat-completions message list with typed
//! input items and, crucially for long sessions, supports folding a span of
//! prior items into an opaque encrypted compaction blob the server can
//! re-ingest without the original text. The blob is carried here as a
//! [`CompactionHandle`] — stored verbatim, echoed back unchanged.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use axon_core::types::{synthesize_call_id, CompactionHandle, Message, Role, ToolCall};

use crate::adapt::{ensure_tool_response_ids, parse_tool_args, tool_response_body};
use crate::extras::{apply_extras, merge_extras};
use crate::provider::{
    retry_after_ms, ChatProvider, ChatRequest, Compaction, ProviderError,
};
use crate::stream::{parse_sse_line, SseParsed, StreamEvent};

pub struct OpenAiResponsesProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    extra_params: serde_json::Map<String, serde_json::Value>,
}

impl OpenAiResponsesProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com".to_string()),
            extra_params: serde_json::Map::new(),
        }
    }

    pub fn with_extra_params(mut self, extras: serde_json::Map<String, serde_json::Value>) -> Self {
        self.extra_params = extras;
        self
    }

    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
        model: &str,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
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
            warn!(status, body = %text, "OpenAI responses API error");
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
impl ChatProvider for OpenAiResponsesProvider {
    fn name(&self) -> &str {
        "openai-responses"
    }

    async fn chat(&self, req: &ChatRequest) -> Result<Message, ProviderError> {
        let body = build_request_body(req, &self.extra_params, false);
        debug!(model = %req.model, "sending request to OpenAI responses API");

        let resp = self.post("/v1/responses", &body, &req.model).await?;
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
        debug!(model = %req.model, "sending streaming request to OpenAI responses API");

        let resp = self.post("/v1/responses", &body, &req.model).await?;
        process_stream(resp, req.model.clone(), tx).await;
        Ok(())
    }

    fn compaction(&self) -> Option<&dyn Compaction> {
        Some(self)
    }
}

#[async_trait]
impl Compaction for OpenAiResponsesProvider {
    async fn compact(
        &self,
        messages: &[Message],
        model: &str,
        previous: Option<&CompactionHandle>,
    ) -> Result<CompactionHandle, ProviderError> {
        let mut body = serde_json::json!({
            "model": model,
            "input": build_input_items(messages),
        });
        if let Some(prev) = previous {
            body["previous_compaction"] = serde_json::json!({
                "type": "compaction",
                "id": prev.id,
                "encrypted_content": prev.encrypted_content,
            });
        }

        let resp = self.post("/v1/responses/compactions", &body, model).await?;
        let compacted: CompactionResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        if compacted.encrypted_content.is_empty() {
            return Err(ProviderError::Parse(
                "compaction returned empty encrypted content".to_string(),
            ));
        }

        Ok(CompactionHandle {
            encrypted_content: compacted.encrypted_content,
            id: compacted.id,
        })
    }
}

fn build_request_body(
    req: &ChatRequest,
    client_extras: &serde_json::Map<String, serde_json::Value>,
    stream: bool,
) -> serde_json::Value {
    let messages = ensure_tool_response_ids(&req.messages);

    let instructions: String = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let non_system: Vec<Message> = messages
        .into_iter()
        .filter(|m| m.role != Role::System)
        .collect();

    let mut body = serde_json::json!({
        "model": req.model,
        "input": build_input_items(&non_system),
        "max_output_tokens": req.max_tokens,
        "stream": stream,
    });
    if !instructions.is_empty() {
        body["instructions"] = serde_json::json!(instructions);
    }

    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                })
            })
            .collect();
        body["tools"] = serde_json::json!(tools);
    }

    let extras = merge_extras(client_extras, &req.extra_params, !req.tools.is_empty());
    apply_extras(&mut body, &extras);
    body
}

/// Map universal messages onto typed responses-API input items.
///
/// Assistant messages carrying a compaction handle become a compaction item
/// with the blob passed through byte-for-byte.
fn build_input_items(messages: &[Message]) -> Vec<serde_json::Value> {
    let mut items = Vec::new();
    for msg in messages {
        if let Some(handle) = &msg.compaction {
            items.push(serde_json::json!({
                "type": "compaction",
                "id": handle.id,
                "encrypted_content": handle.encrypted_content,
            }));
            if msg.content.is_empty() && !msg.has_tool_calls() {
                continue;
            }
        }
        match msg.role {
            Role::Assistant if msg.has_tool_calls() => {
                if !msg.content.is_empty() {
                    items.push(serde_json::json!({
                        "role": "assistant",
                        "content": [{"type": "output_text", "text": msg.content}],
                    }));
                }
                for call in &msg.tool_calls {
                    items.push(serde_json::json!({
                        "type": "function_call",
                        "call_id": call.id,
                        "name": call.name,
                        "arguments": call.args.to_string(),
                    }));
                }
            }
            Role::Tool => items.push(serde_json::json!({
                "type": "function_call_output",
                "call_id": msg.tool_call_id.as_deref().unwrap_or_default(),
                "output": tool_response_body(&msg.content),
            })),
            Role::Assistant => items.push(serde_json::json!({
                "role": "assistant",
                "content": [{"type": "output_text", "text": msg.content}],
            })),
            _ => items.push(serde_json::json!({
                "role": "user",
                "content": [{"type": "input_text", "text": msg.content}],
            })),
        }
    }
    items
}

fn parse_response(resp: ApiResponse) -> Message {
    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for item in resp.output {
        match item {
            OutputItem::Message { content } => {
                for part in content {
                    if let Some(t) = part.text {
                        text.push_str(&t);
                    }
                }
            }
            OutputItem::FunctionCall {
                call_id,
                name,
                arguments,
            } => {
                let id = call_id.unwrap_or_else(synthesize_call_id);
                tool_calls.push(ToolCall::new(id, name, parse_tool_args(&arguments)));
            }
            OutputItem::Unknown => {}
        }
    }

    Message::assistant(text).with_tool_calls(tool_calls)
}

/// Responses-API SSE: semantic events rather than bare deltas.
async fn process_stream(resp: reqwest::Response, model: String, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut current_event = String::new();
    let mut line_buf = String::new();
    // call_id/name captured from output_item.added, args buffered from deltas.
    let mut call_id = String::new();
    let mut call_name = String::new();
    let mut call_args = String::new();
    let mut tokens_in = 0u32;
    let mut tokens_out = 0u32;
    let mut stop_reason = String::new();

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

        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_sse_line(line) {
                Some(SseParsed::Event(ev)) => current_event = ev,
                Some(SseParsed::Data(data)) => match current_event.as_str() {
                    "response.output_text.delta" => {
                        if let Ok(delta) = serde_json::from_str::<TextDeltaEvent>(&data) {
                            if tx
                                .send(StreamEvent::TextDelta { text: delta.delta })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    "response.output_item.added" => {
                        if let Ok(added) = serde_json::from_str::<ItemAddedEvent>(&data) {
                            if added.item.item_type.as_deref() == Some("function_call") {
                                call_id = added.item.call_id.unwrap_or_default();
                                call_name = added.item.name.unwrap_or_default();
                                call_args.clear();
                            }
                        }
                    }
                    "response.function_call_arguments.delta" => {
                        if let Ok(delta) = serde_json::from_str::<TextDeltaEvent>(&data) {
                            call_args.push_str(&delta.delta);
                        }
                    }
                    "response.output_item.done" => {
                        if !call_name.is_empty() {
                            let id = if call_id.is_empty() {
                                synthesize_call_id()
                            } else {
                                std::mem::take(&mut call_id)
                            };
                            let call = ToolCall::new(
                                id,
                                std::mem::take(&mut call_name),
                                parse_tool_args(&call_args),
                            );
                            call_args.clear();
                            if tx.send(StreamEvent::ToolCallDone { call }).await.is_err() {
                                return;
                            }
                        }
                    }
                    "response.completed" => {
                        if let Ok(done) = serde_json::from_str::<CompletedEvent>(&data) {
                            if let Some(usage) = done.response.usage {
                                tokens_in = usage.input_tokens;
                                tokens_out = usage.output_tokens;
                            }
                            stop_reason = done
                                .response
                                .status
                                .unwrap_or_else(|| "completed".to_string());
                        }
                    }
                    _ => {}
                },
                None => {}
            }
        }
        line_buf = remainder;
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

// Responses API wire types (private — deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    output: Vec<OutputItem>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum OutputItem {
    #[serde(rename = "message")]
    Message { content: Vec<ContentPart> },
    #[serde(rename = "function_call")]
    FunctionCall {
        call_id: Option<String>,
        name: String,
        arguments: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct ContentPart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct CompactionResponse {
    id: Option<String>,
    encrypted_content: String,
}

#[derive(Deserialize)]
struct TextDeltaEvent {
    delta: String,
}

#[derive(Deserialize)]
struct ItemAddedEvent {
    item: AddedItem,
}

#[derive(Deserialize)]
struct AddedItem {
    #[serde(rename = "type")]
    item_type: Option<String>,
    call_id: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct CompletedEvent {
    response: CompletedResponse,
}

#[derive(Deserialize)]
struct CompletedResponse {
    usage: Option<ResponseUsage>,
    status: Option<String>,
}

#[derive(Deserialize)]
struct ResponseUsage {
    input_tokens: u32,
    output_tokens: u32,
}
