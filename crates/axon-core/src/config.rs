use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AxonError, Result};

/// Default token headroom left for the model's own output, including
/// private reasoning tokens on reasoning-capable models.
pub const DEFAULT_RESERVE_TOKENS: u32 = 25_000;

/// Top-level config (axon.toml + AXON_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AxonConfig {
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub experience: ExperienceConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
}

impl AxonConfig {
    /// Load from `axon.toml` in the working directory, with `AXON_*`
    /// environment overrides (e.g. `AXON_MEMORY__MAX_KEEP_LAST=10`).
    pub fn load() -> Result<Self> {
        Self::load_from("axon.toml")
    }

    pub fn load_from(path: &str) -> Result<Self> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("AXON_").split("__"))
            .extract()
            .map_err(|e| AxonError::Config(e.to_string()))
    }
}

/// Conversation memory manager tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Token headroom subtracted from the context window.
    #[serde(default = "default_reserve_tokens")]
    pub reserve_tokens: u32,
    /// Minimum raw-message tail kept out of summarization.
    #[serde(default = "default_min_keep_last")]
    pub min_keep_last: usize,
    /// Count-based summarization ceiling (ignored when compaction is on).
    #[serde(default = "default_max_keep_last")]
    pub max_keep_last: usize,
    /// Prefer provider-native compaction over plain summaries.
    #[serde(default)]
    pub compaction: bool,
    /// Character budget for the chunk handed to the compaction capability.
    #[serde(default = "default_compaction_input_chars")]
    pub compaction_input_chars: usize,
    /// Target length for plain rolling summaries.
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,
    /// Model used for plain summarization calls.
    #[serde(default = "default_summary_model")]
    pub summary_model: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            reserve_tokens: default_reserve_tokens(),
            min_keep_last: default_min_keep_last(),
            max_keep_last: default_max_keep_last(),
            compaction: false,
            compaction_input_chars: default_compaction_input_chars(),
            summary_max_chars: default_summary_max_chars(),
            summary_model: default_summary_model(),
        }
    }
}

/// Evolving experience memory tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperienceConfig {
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Cosine similarity at or above which a new experience absorbs an old one.
    #[serde(default = "default_prune_threshold")]
    pub prune_threshold: f32,
    /// Per-day relevance decay base applied at capacity pruning.
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f32,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Relevance-based pruning and dedup-merge. Off = plain FIFO at capacity.
    #[serde(default = "default_smart_prune")]
    pub smart_prune: bool,
    /// Model used for experience summarization calls.
    #[serde(default = "default_summary_model")]
    pub summary_model: String,
    /// Inner-loop budget for the Think–Refine–Act controller.
    #[serde(default = "default_max_inner_steps")]
    pub max_inner_steps: usize,
}

impl Default for ExperienceConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            top_k: default_top_k(),
            prune_threshold: default_prune_threshold(),
            decay_rate: default_decay_rate(),
            window_size: default_window_size(),
            smart_prune: default_smart_prune(),
            summary_model: default_summary_model(),
            max_inner_steps: default_max_inner_steps(),
        }
    }
}

/// Embedding service endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    pub api_key: Option<String>,
    /// Header name carrying the key. `None` = `Authorization: Bearer <key>`.
    pub auth_header: Option<String>,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: default_embedding_url(),
            model: default_embedding_model(),
            api_key: None,
            auth_header: None,
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

/// Provider-level defaults shared by all drivers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Client-wide extra request parameters, merged under per-request overrides.
    #[serde(default)]
    pub extra_params: serde_json::Map<String, serde_json::Value>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            extra_params: serde_json::Map::new(),
        }
    }
}

fn default_reserve_tokens() -> u32 {
    DEFAULT_RESERVE_TOKENS
}

fn default_min_keep_last() -> usize {
    4
}

fn default_max_keep_last() -> usize {
    50
}

fn default_compaction_input_chars() -> usize {
    60_000
}

fn default_summary_max_chars() -> usize {
    1_200
}

fn default_summary_model() -> String {
    "claude-haiku-4-5".to_string()
}

fn default_max_size() -> usize {
    1_000
}

fn default_top_k() -> usize {
    4
}

fn default_prune_threshold() -> f32 {
    0.95
}

fn default_decay_rate() -> f32 {
    0.99
}

fn default_window_size() -> usize {
    20
}

fn default_smart_prune() -> bool {
    true
}

fn default_max_inner_steps() -> usize {
    5
}

fn default_embedding_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_embedding_timeout_secs() -> u64 {
    30
}

fn default_max_tokens() -> u32 {
    4_096
}
