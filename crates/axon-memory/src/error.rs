use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    /// The session does not exist yet. Callers treat this as an empty or
    /// new session, never as a failure.
    #[error("session not found: {user_id}/{session_id}")]
    NotFound {
        user_id: String,
        session_id: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Summarizer error: {0}")]
    Summarizer(String),
}

pub type Result<T> = std::result::Result<T, MemoryError>;
