use thiserror::Error;

#[derive(Debug, Error)]
pub enum AxonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Memory error: {0}")]
    Memory(String),

    #[error("Experience error: {0}")]
    Experience(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AxonError {
    /// Short error code string for clients and structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            AxonError::Config(_) => "CONFIG_ERROR",
            AxonError::Provider(_) => "PROVIDER_ERROR",
            AxonError::Memory(_) => "MEMORY_ERROR",
            AxonError::Experience(_) => "EXPERIENCE_ERROR",
            AxonError::Serialization(_) => "SERIALIZATION_ERROR",
            AxonError::Io(_) => "IO_ERROR",
            AxonError::Cancelled => "CANCELLED",
            AxonError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, AxonError>;
