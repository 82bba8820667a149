use serde::{Deserialize, Serialize};
use std::fmt;

/// Smallest thinking budget the API accepts.
pub const MIN_BUDGET_TOKENS: u32 = 1_024;

/// Model-identifier prefixes for which extended thinking may be enabled.
/// Requests against any other model silently skip the thinking block.
const THINKING_MODELS: &[&str] = &[
    "claude-opus-4",
    "claude-sonnet-4",
    "claude-haiku-4",
    "claude-3-7-sonnet",
];

/// Controls how much token budget the model may spend on internal reasoning
/// before generating the visible response.
///
/// Each level maps to a `budget_tokens` cap. `Off` disables the thinking
/// feature entirely (no thinking block is added).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    Off,
    /// Up to 1 024 tokens of internal reasoning.
    Minimal,
    /// Up to 4 096 tokens of internal reasoning.
    Low,
    /// Up to 8 192 tokens of internal reasoning.
    Medium,
    /// Up to 16 384 tokens of internal reasoning.
    High,
}

impl ThinkingLevel {
    /// Token budget sent to the API. `0` for `Off` — callers skip the
    /// thinking block entirely.
    pub fn budget_tokens(&self) -> u32 {
        match self {
            ThinkingLevel::Off => 0,
            ThinkingLevel::Minimal => 1_024,
            ThinkingLevel::Low => 4_096,
            ThinkingLevel::Medium => 8_192,
            ThinkingLevel::High => 16_384,
        }
    }

    /// Parse from a string slug. Case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" => Some(ThinkingLevel::Off),
            "minimal" => Some(ThinkingLevel::Minimal),
            "low" => Some(ThinkingLevel::Low),
            "medium" => Some(ThinkingLevel::Medium),
            "high" => Some(ThinkingLevel::High),
            _ => None,
        }
    }
}

impl Default for ThinkingLevel {
    fn default() -> Self {
        ThinkingLevel::Off
    }
}

impl fmt::Display for ThinkingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ThinkingLevel::Off => "off",
            ThinkingLevel::Minimal => "minimal",
            ThinkingLevel::Low => "low",
            ThinkingLevel::Medium => "medium",
            ThinkingLevel::High => "high",
        };
        f.write_str(label)
    }
}

/// True when extended thinking may be enabled for this model.
pub fn thinking_allowed(model: &str) -> bool {
    let lower = model.to_lowercase();
    THINKING_MODELS
        .iter()
        .any(|prefix| lower.starts_with(prefix))
}

/// Resolve a thinking request into `(budget_tokens, max_tokens)`.
///
/// Returns `None` when thinking is off or the model is not on the
/// allow-list. The budget is floored at [`MIN_BUDGET_TOKENS`] and
/// `max_tokens` is raised when needed so it strictly exceeds the budget —
/// the API rejects requests where it does not.
pub fn resolve_thinking(
    level: Option<ThinkingLevel>,
    model: &str,
    max_tokens: u32,
) -> Option<(u32, u32)> {
    let level = level?;
    if level == ThinkingLevel::Off || !thinking_allowed(model) {
        return None;
    }
    let budget = level.budget_tokens().max(MIN_BUDGET_TOKENS);
    let max_tokens = if max_tokens > budget {
        max_tokens
    } else {
        budget + MIN_BUDGET_TOKENS
    };
    Some((budget, max_tokens))
}
