//! Evolving experience memory.
//!
//! Task experiences keyed by embedding vectors: searched by cosine
//! similarity, synthesized into prompt fragments, and evolved after each
//! episode with smart deduplication and relevance-decayed pruning. The
//! optional [`controller::TraController`] drives a Think–Refine–Act loop
//! on top of the store and a chat provider.

pub mod controller;
pub mod embedding;
pub mod error;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use controller::{TraController, TraOutcome};
pub use embedding::{Embedder, EmbeddingClient, HashEmbedder};
pub use error::ExperienceError;
pub use memory::{ExperienceMemory, ExperienceStats, ExperienceStore};
pub use sqlite::SqliteExperienceStore;
pub use types::{EvolveOptions, ExperienceEntry, MemoryEdit, MemoryEditKind, MemoryType};
