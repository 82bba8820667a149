//! Conversation memory: persisted chat history fitted into a provider's
//! context window.
//!
//! The [`manager::ConversationMemoryManager`] is stateless and shareable —
//! each call reads through the [`store::ChatStore`] interface, folds old
//! messages into a rolling summary (plain text, provider-native compaction,
//! or both), and returns a bounded message list that never splits an
//! assistant tool call from its responses.

pub mod codec;
pub mod error;
pub mod manager;
pub mod sqlite;
pub mod store;

pub use error::MemoryError;
pub use manager::ConversationMemoryManager;
pub use sqlite::SqliteChatStore;
pub use store::{ChatStore, SessionRecord, StoredMessage};
