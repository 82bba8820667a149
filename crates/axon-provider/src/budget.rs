//! Token budget oracle — conservative context-window sizes per model.
//!
//! Lookup precedence: per-model environment override → exact family map →
//! longest family prefix match → global environment override → conservative
//! default. The family table errs low on purpose; an optimistic window that
//! overflows the provider is far worse than a wasted tail message.

/// Fallback when nothing else matches.
pub const DEFAULT_CONTEXT_TOKENS: u32 = 32_000;

/// Per-model override: `MODEL_<SANITIZED_NAME>_CONTEXT_TOKENS`.
const MODEL_ENV_PREFIX: &str = "MODEL_";
const MODEL_ENV_SUFFIX: &str = "_CONTEXT_TOKENS";

/// Global override applied before the default.
const GLOBAL_ENV_KEY: &str = "MEMORY_AUTO_CONTEXT_WINDOW_TOKENS";

/// Known model families, matched case-insensitively by prefix.
/// Longer prefixes win, so order here is cosmetic.
const FAMILIES: &[(&str, u32)] = &[
    // Anthropic
    ("claude-3-5", 200_000),
    ("claude-3-7", 200_000),
    ("claude-3", 200_000),
    ("claude-opus-4", 200_000),
    ("claude-sonnet-4", 200_000),
    ("claude-haiku-4", 200_000),
    ("claude", 200_000),
    // OpenAI
    ("gpt-5", 256_000),
    ("gpt-4.1", 1_000_000),
    ("gpt-4o", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-4", 8_192),
    ("gpt-3.5-turbo", 16_385),
    ("o1", 200_000),
    ("o3", 200_000),
    ("o4-mini", 200_000),
    // Google
    ("gemini-1.5-pro", 2_000_000),
    ("gemini-1.5-flash", 1_000_000),
    ("gemini-2", 1_000_000),
    ("gemini", 1_000_000),
    // Open-weight and others
    ("llama-3.1", 131_072),
    ("llama-3.3", 131_072),
    ("llama", 8_192),
    ("mistral-large", 128_000),
    ("mistral", 32_000),
    ("deepseek", 65_536),
    ("grok", 131_072),
    ("command-r", 128_000),
    ("command", 4_096),
    ("qwen", 32_768),
];

/// Return the context-window size for `model` and whether the size came
/// from an explicit source (override or family table) rather than the
/// conservative default. The result is always positive.
pub fn context_size(model: &str) -> (u32, bool) {
    if let Some(tokens) = env_tokens(&model_env_key(model)) {
        return (tokens, true);
    }

    let lower = model.to_lowercase();
    if let Some(&(_, tokens)) = FAMILIES.iter().find(|(family, _)| lower == *family) {
        return (tokens, true);
    }
    let best = FAMILIES
        .iter()
        .filter(|(family, _)| lower.starts_with(family))
        .max_by_key(|(family, _)| family.len());
    if let Some(&(_, tokens)) = best {
        return (tokens, true);
    }

    if let Some(tokens) = env_tokens(GLOBAL_ENV_KEY) {
        return (tokens, true);
    }

    (DEFAULT_CONTEXT_TOKENS, false)
}

/// Environment key for a model name: non-alphanumeric → underscore, uppercased.
pub fn model_env_key(model: &str) -> String {
    let sanitized: String = model
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{MODEL_ENV_PREFIX}{sanitized}{MODEL_ENV_SUFFIX}")
}

fn env_tokens(key: &str) -> Option<u32> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|&n| n > 0)
}
