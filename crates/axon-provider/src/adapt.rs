//! Message-adaptation helpers shared by all drivers.

use axon_core::types::{synthesize_call_id, Message, Role};

/// Body substituted for an empty tool response. Several backends reject
/// empty strings in tool-result slots.
pub const EMPTY_TOOL_RESPONSE: &str = r#"{"error":"empty tool response"}"#;

/// Normalize content for backends that reject empty strings.
pub fn normalize_content(content: &str) -> String {
    if content.is_empty() {
        " ".to_string()
    } else {
        content.to_string()
    }
}

/// Normalize a tool-response body.
pub fn tool_response_body(content: &str) -> String {
    if content.is_empty() {
        EMPTY_TOOL_RESPONSE.to_string()
    } else {
        content.to_string()
    }
}

/// Assign ids to tool-response messages that lack one.
///
/// A response without an id is correlated by tool name against the most
/// recent preceding assistant tool call; when no match exists a fresh id is
/// synthesized so the request body stays well-formed.
pub fn ensure_tool_response_ids(messages: &[Message]) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());

    for msg in messages {
        if msg.role != Role::Tool || msg.tool_call_id.is_some() {
            out.push(msg.clone());
            continue;
        }

        let correlated = out
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant)
            .flat_map(|m| m.tool_calls.iter())
            .find(|call| Some(call.name.as_str()) == msg.name.as_deref())
            .map(|call| call.id.clone());

        let mut fixed = msg.clone();
        fixed.tool_call_id = Some(correlated.unwrap_or_else(synthesize_call_id));
        out.push(fixed);
    }

    out
}

/// Lift `properties`/`required` out of a caller-supplied JSON Schema into
/// the canonical object shape backends like Gemini expect. Other keys in
/// the schema are dropped rather than forwarded blindly.
pub fn lift_object_schema(schema: &serde_json::Value) -> serde_json::Value {
    let properties = schema
        .get("properties")
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));
    let required = schema
        .get("required")
        .cloned()
        .unwrap_or_else(|| serde_json::json!([]));
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Parse an accumulated tool-argument buffer, substituting `{}` when the
/// buffer is empty or does not form a JSON object.
pub fn parse_tool_args(buffer: &str) -> serde_json::Value {
    match serde_json::from_str::<serde_json::Value>(buffer) {
        Ok(value) if value.is_object() => value,
        _ => serde_json::Value::Object(Default::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_core::types::ToolCall;

    #[test]
    fn empty_content_becomes_single_space() {
        assert_eq!(normalize_content(""), " ");
        assert_eq!(normalize_content("x"), "x");
    }

    #[test]
    fn empty_tool_response_becomes_error_object() {
        assert_eq!(tool_response_body(""), EMPTY_TOOL_RESPONSE);
        let parsed: serde_json::Value = serde_json::from_str(EMPTY_TOOL_RESPONSE).unwrap();
        assert!(parsed.is_object());
    }

    #[test]
    fn correlates_missing_id_by_name() {
        let assistant = Message::assistant("").with_tool_calls(vec![ToolCall::new(
            "call_7",
            "search",
            serde_json::json!({}),
        )]);
        let mut response = Message::new(Role::Tool, "found it");
        response.name = Some("search".into());

        let fixed = ensure_tool_response_ids(&[assistant, response]);
        assert_eq!(fixed[1].tool_call_id.as_deref(), Some("call_7"));
    }

    #[test]
    fn synthesizes_id_when_no_match() {
        let mut response = Message::new(Role::Tool, "orphan");
        response.name = Some("unknown".into());

        let fixed = ensure_tool_response_ids(&[response]);
        assert!(fixed[0].tool_call_id.as_deref().unwrap().starts_with("call_"));
    }

    #[test]
    fn lifts_properties_and_required() {
        let schema = serde_json::json!({
            "properties": {"q": {"type": "string"}},
            "required": ["q"],
            "additionalProperties": false,
        });
        let lifted = lift_object_schema(&schema);
        assert_eq!(lifted["type"], "object");
        assert_eq!(lifted["required"][0], "q");
        assert!(lifted.get("additionalProperties").is_none());
    }

    #[test]
    fn malformed_args_become_empty_object() {
        assert_eq!(parse_tool_args(""), serde_json::json!({}));
        assert_eq!(parse_tool_args("[1,2]"), serde_json::json!({}));
        assert_eq!(parse_tool_args("{\"a\":1}"), serde_json::json!({"a":1}));
    }
}
