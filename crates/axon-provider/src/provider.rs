use async_trait::async_trait;
use tokio::sync::mpsc;

use axon_core::types::{CompactionHandle, Message, ToolSpec};

use crate::stream::StreamEvent;
use crate::thinking::ThinkingLevel;

/// Request to a chat backend.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    /// Tools to expose to the model. Empty by default.
    pub tools: Vec<ToolSpec>,
    pub max_tokens: u32,
    /// Extended-reasoning budget. Drivers honor it only for models on
    /// their thinking allow-list; `None` and `Some(Off)` both disable it.
    pub thinking: Option<ThinkingLevel>,
    /// Per-request extra wire parameters, merged over the client-wide map.
    pub extra_params: serde_json::Map<String, serde_json::Value>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            max_tokens: 4_096,
            thinking: None,
            extra_params: serde_json::Map::new(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_thinking(mut self, level: ThinkingLevel) -> Self {
        self.thinking = Some(level);
        self
    }
}

/// Common interface for all chat backends.
///
/// `chat` returns the completed assistant [`Message`]; `chat_stream` pushes
/// [`StreamEvent`]s through a channel and always terminates the stream with
/// either `Done` or `Error`. Optional capabilities are discovered through
/// the query methods — consumers must never assume one is present.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider name for logging and error attribution.
    fn name(&self) -> &str;

    /// Send a non-streaming chat request, wait for the full response.
    async fn chat(&self, req: &ChatRequest) -> Result<Message, ProviderError>;

    /// Stream response events through a channel.
    /// Default: falls back to non-streaming chat, emits the pieces, then Done.
    async fn chat_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let msg = self.chat(req).await?;
        if !msg.content.is_empty() {
            let _ = tx
                .send(StreamEvent::TextDelta {
                    text: msg.content.clone(),
                })
                .await;
        }
        for call in msg.tool_calls {
            let _ = tx.send(StreamEvent::ToolCallDone { call }).await;
        }
        let _ = tx
            .send(StreamEvent::Done {
                model: req.model.clone(),
                tokens_in: 0,
                tokens_out: 0,
                stop_reason: String::new(),
            })
            .await;
        Ok(())
    }

    /// Compaction capability, when the backend supports replacing message
    /// spans with opaque state blobs. Default: not supported.
    fn compaction(&self) -> Option<&dyn Compaction> {
        None
    }

    /// Exact-count tokenizer capability. Default: not supported — callers
    /// fall back to the char/4 estimator.
    fn tokenizer(&self) -> Option<&dyn Tokenize> {
        None
    }
}

/// Provider-native compaction: fold `messages` into an opaque encrypted
/// blob the provider can re-ingest without the original text.
#[async_trait]
pub trait Compaction: Send + Sync {
    async fn compact(
        &self,
        messages: &[Message],
        model: &str,
        previous: Option<&CompactionHandle>,
    ) -> Result<CompactionHandle, ProviderError>;
}

/// Exact prompt-token counting through a provider-native endpoint.
#[async_trait]
pub trait Tokenize: Send + Sync {
    async fn count_tokens(
        &self,
        messages: &[Message],
        model: &str,
    ) -> Result<usize, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}) from {model}: {message}")]
    Api {
        status: u16,
        message: String,
        model: String,
    },

    /// The backend refused to answer (safety, recitation, or a malformed
    /// tool call it could not repair). Never retried automatically.
    #[error("response blocked: {reason}")]
    Blocked { reason: String },

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl ProviderError {
    /// True for block signals that must surface to the caller without retry.
    pub fn is_blocked(&self) -> bool {
        matches!(self, ProviderError::Blocked { .. })
    }
}

/// Extract the Retry-After header in milliseconds, defaulting to 5000.
pub(crate) fn retry_after_ms(resp: &reqwest::Response) -> u64 {
    resp.headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|s| s * 1000)
        .unwrap_or(5000)
}
