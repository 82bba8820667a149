use async_trait::async_trait;

use axon_core::types::Role;

use crate::error::Result;

/// A persisted chat message as stored, before rehydration.
///
/// `content` is plain text for user/system messages and a JSON encoding for
/// assistant-with-tool-calls and tool roles (see [`crate::codec`]).
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub role: Role,
    pub content: String,
    /// RFC3339. Ordering by (created_at, id) is stable and total per session.
    pub created_at: String,
}

/// A persisted session row: rolling summary plus the count of messages
/// already folded into it.
#[derive(Debug, Clone, Default)]
pub struct SessionRecord {
    pub user_id: String,
    pub session_id: String,
    /// Dual-summary envelope blob; opaque to the store.
    pub summary: String,
    /// Monotonic non-decreasing.
    pub summarized_count: usize,
    pub created_at: String,
    pub updated_at: String,
}

/// Persistence interface consumed by the conversation memory manager.
///
/// Implementations must be concurrency-safe; the manager holds no state of
/// its own. `NotFound` errors are tolerated everywhere and read as "new
/// session".
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Ordered messages for a session, oldest first. `limit` of 0 = all.
    async fn list_messages(
        &self,
        user_id: &str,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>>;

    async fn get_session(&self, user_id: &str, session_id: &str) -> Result<SessionRecord>;

    /// Return the session, creating an empty row when absent.
    async fn ensure_session(&self, user_id: &str, session_id: &str) -> Result<SessionRecord>;

    async fn append_message(
        &self,
        user_id: &str,
        session_id: &str,
        role: Role,
        content: &str,
    ) -> Result<()>;

    /// Persist summary and summarized-count as a pair — the two must never
    /// diverge, so implementations write them in one statement.
    async fn update_summary(
        &self,
        user_id: &str,
        session_id: &str,
        summary: &str,
        summarized_count: usize,
    ) -> Result<()>;
}
