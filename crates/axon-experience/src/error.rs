use thiserror::Error;

use axon_provider::ProviderError;

#[derive(Debug, Error)]
pub enum ExperienceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Embedding service error ({status}): {message}")]
    Embedding { status: u16, message: String },

    /// The embedding service returned a different number of vectors than
    /// inputs. Fatal to the current operation.
    #[error("embedding count mismatch: expected {expected}, got {got}")]
    CountMismatch { expected: usize, got: usize },

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ExperienceError>;
