use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of memory an experience distils into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Factual,
    Procedural,
    Episodic,
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Factual => write!(f, "factual"),
            Self::Procedural => write!(f, "procedural"),
            Self::Episodic => write!(f, "episodic"),
        }
    }
}

impl std::str::FromStr for MemoryType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "factual" => Ok(Self::Factual),
            "procedural" => Ok(Self::Procedural),
            "episodic" => Ok(Self::Episodic),
            other => Err(format!("unknown memory type: {other}")),
        }
    }
}

/// Structured outcome signal attached to an experience.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredFeedback {
    /// Fraction of the task completed, 0.0–1.0.
    pub progress_rate: f32,
    pub steps_used: u32,
    pub correct: bool,
}

/// One stored task experience.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperienceEntry {
    pub id: String,
    pub input: String,
    pub output: String,
    pub feedback: String,
    /// Distilled lesson produced at evolve time.
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_trace: Option<String>,
    /// "When confronted with X, do Y, avoid Z" distillation, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_card: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_feedback: Option<StructuredFeedback>,
    /// Dimension is fixed per store instance; empty = not yet embedded.
    pub embedding: Vec<f32>,
    pub memory_type: MemoryType,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_accessed_at: chrono::DateTime<chrono::Utc>,
    pub access_count: u32,
    /// Relevance score in [0, ∞), decayed at capacity pruning.
    pub relevance: f32,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ExperienceEntry {
    pub fn new(input: impl Into<String>, output: impl Into<String>, feedback: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            input: input.into(),
            output: output.into(),
            feedback: feedback.into(),
            summary: String::new(),
            reasoning_trace: None,
            strategy_card: None,
            structured_feedback: None,
            embedding: Vec::new(),
            memory_type: MemoryType::Episodic,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            relevance: 1.0,
            metadata: HashMap::new(),
        }
    }
}

/// Optional extras supplied to `evolve`.
#[derive(Debug, Clone, Default)]
pub struct EvolveOptions {
    pub structured_feedback: Option<StructuredFeedback>,
    pub reasoning_trace: Option<String>,
    pub strategy_card: Option<String>,
}

/// A memory edit requested by the Think–Refine–Act controller.
///
/// Wire shape: `{"type":"PRUNE"|"MERGE"|"UPDATE_TAG","ids":[…],"new_summary"?,"tag"?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEdit {
    #[serde(rename = "type")]
    pub kind: MemoryEditKind,
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryEditKind {
    Prune,
    Merge,
    UpdateTag,
}
