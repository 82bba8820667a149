//! Persisted-content codecs.
//!
//! Three wire shapes live in the chat store:
//! - assistant-with-tool-calls content: `{"content":…,"tool_calls":[{id,name,args}]}`
//! - tool content: `{"content":…,"tool_id":…}`
//! - the session summary: a dual envelope `{"compaction":…,"plain":…}` where
//!   either side may be absent. Legacy values (bare plain text, or a raw
//!   `{"type":"compaction",…}` object) decode into the matching field.

use serde::{Deserialize, Serialize};

use axon_core::types::{CompactionHandle, Message, Role, ToolCall};

use crate::store::StoredMessage;

/// Dual-summary envelope: provider-native compaction blob and plain rolling
/// summary, persisted together so a session can move between providers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compaction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plain: Option<String>,
}

impl SummaryEnvelope {
    pub fn is_empty(&self) -> bool {
        self.compaction.is_none() && self.plain.is_none()
    }
}

/// Inner (and legacy single-value) compaction payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionSummary {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub encrypted_content: String,
}

impl CompactionSummary {
    pub fn from_handle(handle: &CompactionHandle) -> Self {
        Self {
            kind: "compaction".to_string(),
            id: handle.id.clone(),
            encrypted_content: handle.encrypted_content.clone(),
        }
    }

    pub fn into_handle(self) -> CompactionHandle {
        CompactionHandle {
            encrypted_content: self.encrypted_content,
            id: self.id,
        }
    }
}

pub fn encode_summary(envelope: &SummaryEnvelope) -> String {
    serde_json::to_string(envelope).unwrap_or_default()
}

/// Decode a stored summary blob, accepting both legacy formats.
pub fn decode_summary(stored: &str) -> SummaryEnvelope {
    if stored.is_empty() {
        return SummaryEnvelope::default();
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(stored) {
        if let Some(obj) = value.as_object() {
            if obj.contains_key("compaction") || obj.contains_key("plain") {
                if let Ok(envelope) = serde_json::from_value::<SummaryEnvelope>(value.clone()) {
                    return envelope;
                }
            }
            // Legacy: a raw compaction object stored as the whole summary.
            if obj.get("type").and_then(|t| t.as_str()) == Some("compaction") {
                return SummaryEnvelope {
                    compaction: Some(stored.to_string()),
                    plain: None,
                };
            }
        }
    }
    // Legacy plain-text summary.
    SummaryEnvelope {
        compaction: None,
        plain: Some(stored.to_string()),
    }
}

/// Decode the compaction side of an envelope into a handle, if present and
/// well-formed.
pub fn decode_compaction(envelope: &SummaryEnvelope) -> Option<CompactionHandle> {
    let raw = envelope.compaction.as_deref()?;
    serde_json::from_str::<CompactionSummary>(raw)
        .ok()
        .map(CompactionSummary::into_handle)
}

pub fn encode_compaction(handle: &CompactionHandle) -> String {
    serde_json::to_string(&CompactionSummary::from_handle(handle)).unwrap_or_default()
}

#[derive(Serialize, Deserialize)]
struct StoredAssistantContent {
    content: String,
    tool_calls: Vec<StoredToolCall>,
}

#[derive(Serialize, Deserialize)]
struct StoredToolCall {
    id: String,
    name: String,
    args: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct StoredToolContent {
    content: String,
    tool_id: String,
}

/// Serialize a message's content for persistence. Assistant messages with
/// tool calls and tool responses are JSON-encoded; everything else passes
/// through as plain text.
pub fn encode_content(msg: &Message) -> String {
    match msg.role {
        Role::Assistant if msg.has_tool_calls() => {
            let stored = StoredAssistantContent {
                content: msg.content.clone(),
                tool_calls: msg
                    .tool_calls
                    .iter()
                    .map(|c| StoredToolCall {
                        id: c.id.clone(),
                        name: c.name.clone(),
                        args: c.args.clone(),
                    })
                    .collect(),
            };
            serde_json::to_string(&stored).unwrap_or_else(|_| msg.content.clone())
        }
        Role::Tool => {
            let stored = StoredToolContent {
                content: msg.content.clone(),
                tool_id: msg.tool_call_id.clone().unwrap_or_default(),
            };
            serde_json::to_string(&stored).unwrap_or_else(|_| msg.content.clone())
        }
        _ => msg.content.clone(),
    }
}

/// Parse a stored message back into the structured schema. Content that
/// fails to parse as the expected JSON shape passes through as plain text.
pub fn rehydrate(stored: &StoredMessage) -> Message {
    match stored.role {
        Role::Assistant => {
            if let Ok(parsed) = serde_json::from_str::<StoredAssistantContent>(&stored.content) {
                return Message::assistant(parsed.content).with_tool_calls(
                    parsed
                        .tool_calls
                        .into_iter()
                        .map(|c| ToolCall::new(c.id, c.name, c.args))
                        .collect(),
                );
            }
            Message::assistant(stored.content.clone())
        }
        Role::Tool => {
            if let Ok(parsed) = serde_json::from_str::<StoredToolContent>(&stored.content) {
                return Message::tool(parsed.tool_id, parsed.content);
            }
            Message::new(Role::Tool, stored.content.clone())
        }
        role => Message::new(role, stored.content.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(role: Role, content: &str) -> StoredMessage {
        StoredMessage {
            id: 1,
            role,
            content: content.to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn assistant_tool_calls_round_trip() {
        let msg = Message::assistant("checking").with_tool_calls(vec![ToolCall::new(
            "call_1",
            "lookup",
            serde_json::json!({"q": "x"}),
        )]);
        let encoded = encode_content(&msg);
        let back = rehydrate(&stored(Role::Assistant, &encoded));
        assert_eq!(back.content, "checking");
        assert_eq!(back.tool_calls.len(), 1);
        assert_eq!(back.tool_calls[0].id, "call_1");
    }

    #[test]
    fn tool_content_round_trips() {
        let msg = Message::tool("call_9", "42");
        let encoded = encode_content(&msg);
        let back = rehydrate(&stored(Role::Tool, &encoded));
        assert_eq!(back.tool_call_id.as_deref(), Some("call_9"));
        assert_eq!(back.content, "42");
    }

    #[test]
    fn plain_assistant_text_passes_through() {
        let back = rehydrate(&stored(Role::Assistant, "just text"));
        assert_eq!(back.content, "just text");
        assert!(back.tool_calls.is_empty());
    }

    #[test]
    fn envelope_encode_decode_round_trips() {
        for envelope in [
            SummaryEnvelope {
                compaction: Some(r#"{"type":"compaction","encrypted_content":"x"}"#.into()),
                plain: Some("summary".into()),
            },
            SummaryEnvelope {
                compaction: None,
                plain: Some("only plain".into()),
            },
            SummaryEnvelope::default(),
        ] {
            let encoded = encode_summary(&envelope);
            assert_eq!(decode_summary(&encoded), envelope);
        }
    }

    #[test]
    fn legacy_plain_text_decodes_into_plain_field() {
        let envelope = decode_summary("an old freeform summary");
        assert_eq!(envelope.plain.as_deref(), Some("an old freeform summary"));
        assert!(envelope.compaction.is_none());
    }

    #[test]
    fn legacy_compaction_object_decodes_into_compaction_field() {
        let raw = r#"{"type":"compaction","id":"c1","encrypted_content":"blob=="}"#;
        let envelope = decode_summary(raw);
        assert_eq!(envelope.compaction.as_deref(), Some(raw));
        assert!(envelope.plain.is_none());

        let handle = decode_compaction(&envelope).unwrap();
        assert_eq!(handle.encrypted_content, "blob==");
        assert_eq!(handle.id.as_deref(), Some("c1"));
    }

    #[test]
    fn unrelated_json_object_reads_as_plain_text() {
        let raw = r#"{"something":"else"}"#;
        let envelope = decode_summary(raw);
        assert_eq!(envelope.plain.as_deref(), Some(raw));
    }

    #[test]
    fn compaction_handle_codec_round_trips() {
        let handle = CompactionHandle {
            encrypted_content: "opaque==".into(),
            id: None,
        };
        let encoded = encode_compaction(&handle);
        let envelope = SummaryEnvelope {
            compaction: Some(encoded),
            plain: None,
        };
        assert_eq!(decode_compaction(&envelope).unwrap(), handle);
    }
}
