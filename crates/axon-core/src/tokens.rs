//! Token estimation heuristic and opaque-signature codecs.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::types::Message;

/// Rough chars-per-token ratio for the fallback estimator.
const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token count of a text with the char/4 heuristic.
///
/// Callers that need exact counts use a provider's `Tokenize` capability
/// and fall back here when it is unavailable.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Estimate the token count of a message list, including tool-call argument
/// payloads (which count against the prompt like any other content).
pub fn estimate_message_tokens(messages: &[Message]) -> usize {
    messages
        .iter()
        .map(|m| {
            let mut chars = m.content.chars().count();
            for call in &m.tool_calls {
                chars += call.name.len() + call.args.to_string().chars().count();
            }
            chars.div_ceil(CHARS_PER_TOKEN)
        })
        .sum()
}

/// Encode an opaque signature as base64 for JSON/DB round-trips.
pub fn encode_signature(raw: &[u8]) -> String {
    STANDARD.encode(raw)
}

/// Decode a base64 thought signature back to raw bytes.
///
/// A signature that passed through UTF-8-only storage and picked up
/// U+FFFD replacement characters is corrupted; it is discarded (empty
/// result) rather than echoed back to the provider.
pub fn decode_signature(encoded: &str) -> Vec<u8> {
    if encoded.contains('\u{FFFD}') {
        return Vec::new();
    }
    STANDARD.decode(encoded).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Message, ToolCall};

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn message_estimate_counts_tool_args() {
        let plain = Message::user("12345678");
        let with_call = Message::assistant("").with_tool_calls(vec![ToolCall::new(
            "call_1",
            "search",
            serde_json::json!({"q": "rust"}),
        )]);
        assert_eq!(estimate_message_tokens(&[plain]), 2);
        assert!(estimate_message_tokens(&[with_call]) > 0);
    }

    #[test]
    fn signature_round_trip_is_bit_exact() {
        let raw: Vec<u8> = (0u8..=255).collect();
        let encoded = encode_signature(&raw);
        assert_eq!(decode_signature(&encoded), raw);
    }

    #[test]
    fn replacement_char_signature_decodes_empty() {
        let corrupted = format!("abc{}def", '\u{FFFD}');
        assert!(decode_signature(&corrupted).is_empty());
    }
}
