//! Shared contracts for the Axon agent runtime.
//!
//! Everything the provider, memory, and experience crates agree on lives
//! here: the universal message model, session identifiers, configuration,
//! the top-level error type, and the token estimation heuristic.

pub mod config;
pub mod error;
pub mod tokens;
pub mod types;

pub use config::AxonConfig;
pub use error::{AxonError, Result};
pub use types::{
    CompactionHandle, ImageData, Message, Role, SessionId, ToolCall, ToolSpec, UserId,
};
