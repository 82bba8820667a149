//! Provider abstraction and streaming dispatcher.
//!
//! One normalized contract ([`ChatProvider`]) over heterogeneous chat
//! backends, with optional capabilities discovered by query
//! ([`Compaction`], [`Tokenize`]). Four drivers ship here:
//!
//! - [`anthropic::AnthropicProvider`] — messages API with extended thinking
//! - [`openai::OpenAiProvider`] — chat-completions with function calling
//! - [`responses::OpenAiResponsesProvider`] — responses API with compaction
//! - [`gemini::GeminiProvider`] — generateContent with thought signatures
//!
//! Each driver owns a streaming accumulator that assembles deltas, partial
//! JSON tool arguments, and thought summaries into completed records.

pub mod adapt;
pub mod anthropic;
pub mod anthropic_stream;
pub mod budget;
pub mod extras;
pub mod gemini;
pub mod mock;
pub mod openai;
pub mod provider;
pub mod responses;
pub mod stream;
pub mod thinking;
pub mod tokenize;

pub use provider::{ChatProvider, ChatRequest, Compaction, ProviderError, Tokenize};
pub use stream::{collect_stream, StreamEvent, StreamStats};
pub use thinking::ThinkingLevel;
