use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use axon_core::types::{Message, Role, ToolCall};

use crate::adapt::{ensure_tool_response_ids, normalize_content, tool_response_body};
use crate::extras::{apply_extras, merge_extras};
use crate::provider::{retry_after_ms, ChatProvider, ChatRequest, ProviderError, Tokenize};
use crate::stream::StreamEvent;
use crate::thinking::resolve_thinking;

const API_VERSION: &str = "2023-06-01";

/// Anthropic messages-API driver.
///
/// Thinking-block provider: extended reasoning is enabled only for models on
/// the thinking allow-list, with `max_tokens` raised above `budget_tokens`
/// when the caller's value would not clear it.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    extra_params: serde_json::Map<String, serde_json::Value>,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            extra_params: serde_json::Map::new(),
        }
    }

    /// Set client-wide extra request parameters, merged under per-request
    /// overrides on every call.
    pub fn with_extra_params(mut self, extras: serde_json::Map<String, serde_json::Value>) -> Self {
        self.extra_params = extras;
        self
    }

    async fn post(
        &self,
        body: &serde_json::Value,
        model: &str,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
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
            warn!(status, body = %text, "Anthropic API error");
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
impl ChatProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn chat(&self, req: &ChatRequest) -> Result<Message, ProviderError> {
        let body = build_request_body(req, &self.extra_params, false);
        debug!(model = %req.model, "sending request to Anthropic");

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
        debug!(model = %req.model, "sending streaming request to Anthropic");

        let resp = self.post(&body, &req.model).await?;
        crate::anthropic_stream::process_stream(resp, tx).await;
        Ok(())
    }

    fn tokenizer(&self) -> Option<&dyn Tokenize> {
        Some(self)
    }
}

#[async_trait]
impl Tokenize for AnthropicProvider {
    /// Exact prompt-token count via the native count_tokens endpoint.
    async fn count_tokens(
        &self,
        messages: &[Message],
        model: &str,
    ) -> Result<usize, ProviderError> {
        let req = ChatRequest::new(model, messages.to_vec());
        let mut body = build_request_body(&req, &serde_json::Map::new(), false);
        if let Some(obj) = body.as_object_mut() {
            // count_tokens takes the same shape minus generation controls.
            obj.remove("max_tokens");
            obj.remove("stream");
        }

        let url = format!("{}/v1/messages/count_tokens", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status,
                message: text,
                model: model.to_string(),
            });
        }
        let counted: CountTokensResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(counted.input_tokens as usize)
    }
}

fn build_request_body(
    req: &ChatRequest,
    client_extras: &serde_json::Map<String, serde_json::Value>,
    stream: bool,
) -> serde_json::Value {
    let messages = ensure_tool_response_ids(&req.messages);

    // System-role messages fold into the dedicated top-level field.
    let system: String = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let wire_messages: Vec<serde_json::Value> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(adapt_message)
        .collect();

    let (thinking, max_tokens) = match resolve_thinking(req.thinking, &req.model, req.max_tokens) {
        Some((budget, max)) => (
            Some(serde_json::json!({"type": "enabled", "budget_tokens": budget})),
            max,
        ),
        None => (None, req.max_tokens),
    };

    let mut body = serde_json::json!({
        "model": req.model,
        "max_tokens": max_tokens,
        "messages": wire_messages,
        "stream": stream,
    });
    if !system.is_empty() {
        body["system"] = serde_json::json!(system);
    }
    if let Some(thinking) = thinking {
        body["thinking"] = thinking;
    }

    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();
        body["tools"] = serde_json::Value::Array(tools);
    }

    let extras = merge_extras(client_extras, &req.extra_params, !req.tools.is_empty());
    apply_extras(&mut body, &extras);
    body
}

/// Map one universal message onto the Anthropic wire shape.
fn adapt_message(msg: &Message) -> serde_json::Value {
    match msg.role {
        Role::Assistant if msg.has_tool_calls() => {
            let mut blocks: Vec<serde_json::Value> = Vec::new();
            if !msg.content.is_empty() {
                blocks.push(serde_json::json!({"type": "text", "text": msg.content}));
            }
            for call in &msg.tool_calls {
                blocks.push(serde_json::json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.name,
                    "input": call.args,
                }));
            }
            serde_json::json!({"role": "assistant", "content": blocks})
        }
        Role::Tool => {
            // Tool responses ride in a user turn as tool_result blocks.
            serde_json::json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": msg.tool_call_id.as_deref().unwrap_or_default(),
                    "content": tool_response_body(&msg.content),
                }],
            })
        }
        Role::User if !msg.images.is_empty() => {
            let mut blocks: Vec<serde_json::Value> = msg
                .images
                .iter()
                .map(|img| {
                    serde_json::json!({
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": img.mime_type,
                            "data": img.data,
                        },
                    })
                })
                .collect();
            blocks.push(serde_json::json!({
                "type": "text",
                "text": normalize_content(&msg.content),
            }));
            serde_json::json!({"role": "user", "content": blocks})
        }
        _ => {
            let role = if msg.role == Role::Assistant {
                "assistant"
            } else {
                "user"
            };
            serde_json::json!({"role": role, "content": normalize_content(&msg.content)})
        }
    }
}

fn parse_response(resp: ApiResponse) -> Message {
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in resp.content {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            ContentBlock::ToolUse { id, name, input } => {
                let args = if input.is_object() {
                    input
                } else {
                    serde_json::Value::Object(Default::default())
                };
                tool_calls.push(ToolCall::new(id, name, args));
            }
            _ => {}
        }
    }

    Message::assistant(text_parts.join("")).with_tool_calls(tool_calls)
}

// Anthropic API response types (private — deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct CountTokensResponse {
    input_tokens: u64,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    /// Internal reasoning block — filtered out of the returned message;
    /// callers never receive raw thinking text via the non-streaming path.
    #[serde(rename = "thinking")]
    #[allow(dead_code)]
    Thinking { thinking: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thinking::ThinkingLevel;
    use axon_core::types::ToolSpec;

    fn request(messages: Vec<Message>) -> ChatRequest {
        ChatRequest::new("claude-sonnet-4-5", messages)
    }

    #[test]
    fn system_messages_fold_into_system_field() {
        let req = request(vec![
            Message::system("be terse"),
            Message::user("hi"),
        ]);
        let body = build_request_body(&req, &serde_json::Map::new(), false);
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn tool_chain_maps_to_blocks() {
        let assistant = Message::assistant("checking").with_tool_calls(vec![ToolCall::new(
            "call_1",
            "lookup",
            serde_json::json!({"q": "x"}),
        )]);
        let req = request(vec![
            Message::user("q"),
            assistant,
            Message::tool("call_1", "result"),
        ]);
        let body = build_request_body(&req, &serde_json::Map::new(), false);
        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs[1]["content"][1]["type"], "tool_use");
        assert_eq!(msgs[2]["content"][0]["type"], "tool_result");
        assert_eq!(msgs[2]["content"][0]["tool_use_id"], "call_1");
    }

    #[test]
    fn empty_tool_response_is_replaced() {
        let req = request(vec![Message::tool("call_1", "")]);
        let body = build_request_body(&req, &serde_json::Map::new(), false);
        let content = body["messages"][0]["content"][0]["content"]
            .as_str()
            .unwrap();
        assert!(content.contains("empty tool response"));
    }

    #[test]
    fn empty_user_content_becomes_space() {
        let req = request(vec![Message::user("")]);
        let body = build_request_body(&req, &serde_json::Map::new(), false);
        assert_eq!(body["messages"][0]["content"], " ");
    }

    #[test]
    fn thinking_block_added_for_allowed_model() {
        let mut req = request(vec![Message::user("hi")]);
        req.thinking = Some(ThinkingLevel::Medium);
        req.max_tokens = 2_048;
        let body = build_request_body(&req, &serde_json::Map::new(), false);
        assert_eq!(body["thinking"]["budget_tokens"], 8_192);
        assert!(body["max_tokens"].as_u64().unwrap() > 8_192);
    }

    #[test]
    fn thinking_skipped_for_disallowed_model() {
        let mut req = ChatRequest::new("gpt-4o", vec![Message::user("hi")]);
        req.thinking = Some(ThinkingLevel::High);
        let body = build_request_body(&req, &serde_json::Map::new(), false);
        assert!(body.get("thinking").is_none());
    }

    #[test]
    fn tool_schema_passes_through_unchanged() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"],
        });
        let req = request(vec![Message::user("hi")]).with_tools(vec![ToolSpec {
            name: "read_file".into(),
            description: "read a file".into(),
            input_schema: schema.clone(),
        }]);
        let body = build_request_body(&req, &serde_json::Map::new(), false);
        assert_eq!(body["tools"][0]["input_schema"], schema);
    }

    #[test]
    fn non_object_tool_input_is_normalized() {
        let resp = ApiResponse {
            content: vec![ContentBlock::ToolUse {
                id: "call_1".into(),
                name: "t".into(),
                input: serde_json::json!("not-an-object"),
            }],
        };
        let msg = parse_response(resp);
        assert_eq!(msg.tool_calls[0].args, serde_json::json!({}));
    }
}
