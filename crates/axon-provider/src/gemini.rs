//! Google Gemini generateContent driver.
//!
//! Thought signatures are the continuity mechanism here: reasoning-capable
//! Gemini models attach an opaque signature to response parts, and validity
//! on the next turn requires echoing each signature on the *same* part it
//! arrived on — tool-call signatures on that functionCall part, per-message
//! signatures on the text part. Signatures must never ride on
//! functionResponse parts; the server rejects the request.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use axon_core::tokens::decode_signature;
use axon_core::types::{synthesize_call_id, ImageData, Message, Role, ToolCall};

use crate::adapt::{ensure_tool_response_ids, lift_object_schema, normalize_content, tool_response_body};
use crate::provider::{retry_after_ms, ChatProvider, ChatRequest, ProviderError};
use crate::stream::{parse_sse_line, SseParsed, StreamEvent};

/// Candidate finish reasons that surface as a typed block error.
const BLOCK_REASONS: &[&str] = &["SAFETY", "RECITATION", "MALFORMED_FUNCTION_CALL"];

pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string()),
        }
    }

    fn endpoint(&self, model: &str, stream: bool) -> String {
        let verb = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        format!("{}/v1beta/models/{}:{}", self.base_url, model, verb)
    }

    async fn post(
        &self,
        url: &str,
        body: &serde_json::Value,
        model: &str,
    ) -> Result<reqwest::Response, ProviderError> {
        let resp = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
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
            warn!(status, body = %text, "Gemini API error");
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
impl ChatProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn chat(&self, req: &ChatRequest) -> Result<Message, ProviderError> {
        let body = build_request_body(req);
        debug!(model = %req.model, "sending request to Gemini");

        let resp = self
            .post(&self.endpoint(&req.model, false), &body, &req.model)
            .await?;
        let api_resp: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        parse_response(api_resp)
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let body = build_request_body(req);
        debug!(model = %req.model, "sending streaming request to Gemini");

        let resp = self
            .post(&self.endpoint(&req.model, true), &body, &req.model)
            .await?;
        process_stream(resp, req.model.clone(), tx).await;
        Ok(())
    }
}

/// A stored signature is echoed only when it still decodes cleanly; a
/// base64 string corrupted into U+FFFD by a lossy round-trip is dropped.
fn usable_signature(sig: &Option<String>) -> Option<&str> {
    let sig = sig.as_deref()?;
    if sig.is_empty() || decode_signature(sig).is_empty() {
        return None;
    }
    Some(sig)
}

pub(crate) fn build_request_body(req: &ChatRequest) -> serde_json::Value {
    let messages = ensure_tool_response_ids(&req.messages);

    let system: String = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let contents: Vec<serde_json::Value> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(adapt_message)
        .collect();

    let mut body = serde_json::json!({
        "contents": contents,
        "generationConfig": {
            "maxOutputTokens": req.max_tokens,
        },
    });
    if !system.is_empty() {
        body["systemInstruction"] = serde_json::json!({"parts": [{"text": system}]});
    }
    if !req.tools.is_empty() {
        let declarations: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": lift_object_schema(&t.input_schema),
                })
            })
            .collect();
        body["tools"] = serde_json::json!([{"functionDeclarations": declarations}]);
    }
    body
}

fn adapt_message(msg: &Message) -> serde_json::Value {
    match msg.role {
        Role::Assistant => {
            let mut parts: Vec<serde_json::Value> = Vec::new();
            if !msg.content.is_empty() || msg.tool_calls.is_empty() {
                let mut part = serde_json::json!({"text": normalize_content(&msg.content)});
                // Per-message signature echoes on the text part.
                if let Some(sig) = usable_signature(&msg.thought_signature) {
                    part["thoughtSignature"] = serde_json::json!(sig);
                }
                parts.push(part);
            }
            for call in &msg.tool_calls {
                let mut part = serde_json::json!({
                    "functionCall": {"name": call.name, "args": call.args},
                });
                // Per-tool-call signature echoes on that exact part.
                if let Some(sig) = usable_signature(&call.thought_signature) {
                    part["thoughtSignature"] = serde_json::json!(sig);
                }
                parts.push(part);
            }
            serde_json::json!({"role": "model", "parts": parts})
        }
        Role::Tool => {
            // No signature here, ever — the server errors on signed
            // functionResponse parts.
            let response = serde_json::json!({"content": tool_response_body(&msg.content)});
            serde_json::json!({
                "role": "user",
                "parts": [{
                    "functionResponse": {
                        "name": msg.name.as_deref().unwrap_or_default(),
                        "response": response,
                    }
                }],
            })
        }
        _ => {
            let mut parts = vec![serde_json::json!({"text": normalize_content(&msg.content)})];
            for img in &msg.images {
                parts.push(serde_json::json!({
                    "inlineData": {"mimeType": img.mime_type, "data": img.data},
                }));
            }
            serde_json::json!({"role": "user", "parts": parts})
        }
    }
}

fn check_blocked(resp: &GenerateResponse) -> Option<ProviderError> {
    if let Some(feedback) = &resp.prompt_feedback {
        if let Some(reason) = &feedback.block_reason {
            return Some(ProviderError::Blocked {
                reason: reason.clone(),
            });
        }
    }
    let candidate = resp.candidates.as_deref()?.first()?;
    let reason = candidate.finish_reason.as_deref()?;
    if BLOCK_REASONS.contains(&reason) {
        return Some(ProviderError::Blocked {
            reason: reason.to_string(),
        });
    }
    None
}

fn parse_response(resp: GenerateResponse) -> Result<Message, ProviderError> {
    if let Some(err) = check_blocked(&resp) {
        return Err(err);
    }

    let mut msg = Message::assistant("");
    let Some(candidate) = resp.candidates.and_then(|c| c.into_iter().next()) else {
        return Err(ProviderError::Parse("no candidates in response".to_string()));
    };
    let Some(content) = candidate.content else {
        return Err(ProviderError::Parse("candidate has no content".to_string()));
    };

    for part in content.parts.unwrap_or_default() {
        if let Some(call) = part.function_call {
            let mut tool_call = ToolCall::new(
                synthesize_call_id(),
                call.name,
                if call.args.is_object() {
                    call.args
                } else {
                    serde_json::Value::Object(Default::default())
                },
            );
            tool_call.thought_signature = part.thought_signature;
            msg.tool_calls.push(tool_call);
        } else if let Some(text) = part.text {
            if part.thought.unwrap_or(false) {
                // Thought summaries are dropped from the final message on
                // the non-streaming path.
                continue;
            }
            msg.content.push_str(&text);
            if part.thought_signature.is_some() {
                msg.thought_signature = part.thought_signature;
            }
        } else if let Some(data) = part.inline_data {
            msg.images.push(ImageData {
                mime_type: data.mime_type,
                data: data.data,
            });
        }
    }

    Ok(msg)
}

/// Gemini streaming: each SSE data line is a full GenerateContentResponse
/// chunk. Intermediate chunks with empty candidates or nil content are not
/// errors — skip and continue.
async fn process_stream(resp: reqwest::Response, model: String, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut line_buf = String::new();
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
            let Some(SseParsed::Data(data)) = parse_sse_line(line) else {
                continue;
            };
            let Ok(chunk_resp) = serde_json::from_str::<GenerateResponse>(&data) else {
                debug!(data, "skipping unparseable stream chunk");
                continue;
            };

            if let Some(err) = check_blocked(&chunk_resp) {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: err.to_string(),
                    })
                    .await;
                return;
            }

            if let Some(usage) = &chunk_resp.usage_metadata {
                tokens_in = usage.prompt_token_count.unwrap_or(0);
                tokens_out = usage.candidates_token_count.unwrap_or(0);
            }

            // Empty candidate lists mid-stream are normal; skip.
            let Some(candidate) = chunk_resp
                .candidates
                .and_then(|c| c.into_iter().next())
            else {
                continue;
            };
            if let Some(reason) = &candidate.finish_reason {
                stop_reason = reason.clone();
            }
            let Some(content) = candidate.content else {
                continue;
            };

            for part in content.parts.unwrap_or_default() {
                let event = if let Some(call) = part.function_call {
                    // Gemini sends complete function calls per chunk.
                    let mut tool_call = ToolCall::new(
                        synthesize_call_id(),
                        call.name,
                        if call.args.is_object() {
                            call.args
                        } else {
                            serde_json::Value::Object(Default::default())
                        },
                    );
                    tool_call.thought_signature = part.thought_signature;
                    Some(StreamEvent::ToolCallDone { call: tool_call })
                } else if let Some(text) = part.text {
                    if part.thought.unwrap_or(false) {
                        Some(StreamEvent::ThoughtDelta { text })
                    } else {
                        Some(StreamEvent::TextDelta { text })
                    }
                } else if let Some(data) = part.inline_data {
                    Some(StreamEvent::Image {
                        image: ImageData {
                            mime_type: data.mime_type,
                            data: data.data,
                        },
                    })
                } else {
                    None
                };
                if let Some(event) = event {
                    if tx.send(event).await.is_err() {
                        return; // receiver dropped
                    }
                }
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

// Gemini API wire types (private — deserialization only)

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    prompt_feedback: Option<PromptFeedback>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    parts: Option<Vec<Part>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    thought: Option<bool>,
    thought_signature: Option<String>,
    function_call: Option<FunctionCall>,
    inline_data: Option<InlineData>,
}

#[derive(Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_core::tokens::encode_signature;

    #[test]
    fn tool_call_signature_echoes_on_function_call_part() {
        let sig = encode_signature(b"continuity-token");
        let mut call = ToolCall::new("call_1", "lookup", serde_json::json!({"q": "x"}));
        call.thought_signature = Some(sig.clone());
        let assistant = Message::assistant("").with_tool_calls(vec![call]);

        let req = ChatRequest::new("gemini-2.5-pro", vec![assistant]);
        let body = build_request_body(&req);
        let parts = body["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts[0]["thoughtSignature"], serde_json::json!(sig));
        assert!(parts[0].get("functionCall").is_some());
    }

    #[test]
    fn message_signature_echoes_on_text_part() {
        let sig = encode_signature(b"msg-sig");
        let mut assistant = Message::assistant("done");
        assistant.thought_signature = Some(sig.clone());

        let req = ChatRequest::new("gemini-2.5-pro", vec![assistant]);
        let body = build_request_body(&req);
        assert_eq!(
            body["contents"][0]["parts"][0]["thoughtSignature"],
            serde_json::json!(sig)
        );
    }

    #[test]
    fn corrupted_signature_is_dropped() {
        let mut assistant = Message::assistant("done");
        assistant.thought_signature = Some(format!("bad{}sig", '\u{FFFD}'));

        let req = ChatRequest::new("gemini-2.5-pro", vec![assistant]);
        let body = build_request_body(&req);
        assert!(body["contents"][0]["parts"][0]
            .get("thoughtSignature")
            .is_none());
    }

    #[test]
    fn function_response_parts_never_carry_signatures() {
        let mut tool_msg = Message::tool("call_1", "result");
        tool_msg.name = Some("lookup".into());
        // Even if a signature somehow landed on the tool message, it must
        // not be serialized onto the functionResponse part.
        tool_msg.thought_signature = Some(encode_signature(b"stray"));

        let req = ChatRequest::new("gemini-2.5-pro", vec![tool_msg]);
        let body = build_request_body(&req);
        let part = &body["contents"][0]["parts"][0];
        assert!(part.get("functionResponse").is_some());
        assert!(part.get("thoughtSignature").is_none());
    }

    #[test]
    fn schema_is_lifted_for_function_declarations() {
        let req = ChatRequest::new("gemini-2.5-flash", vec![Message::user("hi")]).with_tools(vec![
            axon_core::types::ToolSpec {
                name: "t".into(),
                description: "d".into(),
                input_schema: serde_json::json!({
                    "properties": {"a": {"type": "string"}},
                    "required": ["a"],
                    "$schema": "ignored",
                }),
            },
        ]);
        let body = build_request_body(&req);
        let params = &body["tools"][0]["functionDeclarations"][0]["parameters"];
        assert_eq!(params["type"], "object");
        assert!(params.get("$schema").is_none());
    }

    #[test]
    fn safety_block_is_typed_error() {
        let resp: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"finishReason":"SAFETY"}]}"#,
        )
        .unwrap();
        match parse_response(resp) {
            Err(ProviderError::Blocked { reason }) => assert_eq!(reason, "SAFETY"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn prompt_block_is_typed_error() {
        let resp: GenerateResponse = serde_json::from_str(
            r#"{"promptFeedback":{"blockReason":"PROHIBITED_CONTENT"}}"#,
        )
        .unwrap();
        assert!(matches!(
            parse_response(resp),
            Err(ProviderError::Blocked { .. })
        ));
    }

    #[test]
    fn response_parts_parse_into_message() {
        let resp: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[
                {"text":"sure, "},
                {"text":"done","thoughtSignature":"c2ln"},
                {"functionCall":{"name":"calc","args":{"n":1}},"thoughtSignature":"dG9vbA=="}
            ]}}]}"#,
        )
        .unwrap();
        let msg = parse_response(resp).unwrap();
        assert_eq!(msg.content, "sure, done");
        assert_eq!(msg.thought_signature.as_deref(), Some("c2ln"));
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(
            msg.tool_calls[0].thought_signature.as_deref(),
            Some("dG9vbA==")
        );
        assert!(msg.tool_calls[0].id.starts_with("call_"));
    }
}
