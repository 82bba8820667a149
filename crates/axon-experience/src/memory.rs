//! The evolving experience store: search / synthesize / evolve.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use axon_core::config::ExperienceConfig;
use axon_core::types::Message;
use axon_provider::{ChatProvider, ChatRequest};

use crate::embedding::Embedder;
use crate::error::{ExperienceError, Result};
use crate::types::{EvolveOptions, ExperienceEntry, MemoryEdit, MemoryEditKind, MemoryType};

/// Background persistence deadline. The user turn never waits on a save.
const PERSIST_TIMEOUT: Duration = Duration::from_secs(5);

const SUMMARY_FALLBACK: &str = "(summary unavailable)";

const EXPERIENCE_SUMMARIZER_SYSTEM: &str = "You distill task experiences into reusable \
lessons. Reply with a single lesson of at most 100 words. No preamble.";

/// Snapshot persistence for experience entries, keyed by (user, session).
#[async_trait]
pub trait ExperienceStore: Send + Sync {
    async fn load(&self, user_id: &str, session_id: &str) -> Result<Vec<ExperienceEntry>>;
    async fn save(
        &self,
        user_id: &str,
        session_id: &str,
        entries: &[ExperienceEntry],
    ) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct ExperienceStats {
    pub total: usize,
    pub factual: usize,
    pub procedural: usize,
    pub episodic: usize,
}

/// Internally synchronized experience memory.
///
/// Reads (search, window, stats) copy out under a read lock; mutations
/// (evolve, apply_edits, access-metric updates) take the write lock. The
/// optional store is a write-through backup fed by background snapshots.
///
/// The pruning strategy (relevance decay vs FIFO) is snapshotted from the
/// config at construction and never re-read.
pub struct ExperienceMemory {
    provider: Arc<dyn ChatProvider>,
    embedder: Arc<dyn Embedder>,
    store: Option<Arc<dyn ExperienceStore>>,
    entries: Arc<RwLock<Vec<ExperienceEntry>>>,
    config: ExperienceConfig,
    smart_prune: bool,
    user_id: String,
    session_id: String,
}

impl ExperienceMemory {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        embedder: Arc<dyn Embedder>,
        config: ExperienceConfig,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        let smart_prune = config.smart_prune;
        Self {
            provider,
            embedder,
            store: None,
            entries: Arc::new(RwLock::new(Vec::new())),
            config,
            smart_prune,
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ExperienceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace in-memory entries with the persisted snapshot.
    pub async fn hydrate(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let loaded = store.load(&self.user_id, &self.session_id).await?;
        info!(count = loaded.len(), "experience memory hydrated");
        *self.entries.write().await = loaded;
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Top-k entries by cosine similarity against the query embedding,
    /// sorted descending. Access metrics update asynchronously; a reader
    /// may observe a slightly stale snapshot.
    pub async fn search(&self, query: &str) -> Result<Vec<(ExperienceEntry, f32)>> {
        if self.is_empty().await {
            return Ok(Vec::new());
        }
        let query_vec = self.embedder.embed_one(query).await?;

        let scored = {
            let entries = self.entries.read().await;
            let mut scored: Vec<(ExperienceEntry, f32)> = entries
                .iter()
                .filter(|e| !e.embedding.is_empty())
                .map(|e| (e.clone(), cosine_similarity(&query_vec, &e.embedding)))
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(self.config.top_k);
            scored
        };

        let ids: Vec<String> = scored.iter().map(|(e, _)| e.id.clone()).collect();
        let entries = self.entries.clone();
        tokio::spawn(async move {
            let mut entries = entries.write().await;
            let now = chrono::Utc::now();
            for entry in entries.iter_mut() {
                if ids.contains(&entry.id) {
                    entry.access_count += 1;
                    entry.last_accessed_at = now;
                }
            }
        });

        Ok(scored)
    }

    /// Render retrieved experiences plus the current task into a prompt
    /// fragment.
    pub fn synthesize(task: &str, retrieved: &[(ExperienceEntry, f32)]) -> String {
        let mut out = String::from("## Relevant past experiences\n");
        if retrieved.is_empty() {
            out.push_str("(none)\n");
        }
        for (i, (entry, score)) in retrieved.iter().enumerate() {
            out.push_str(&format!("\n### Experience {} (score {:.2})\n", i + 1, score));
            out.push_str(&format!("- Task: {}\n", entry.input));
            out.push_str(&format!("- Outcome: {}\n", entry.feedback));
            out.push_str(&format!("- Type: {}\n", entry.memory_type));
            out.push_str(&format!("- Lesson: {}\n", entry.summary));
            if let Some(card) = &entry.strategy_card {
                out.push_str(&format!("- Strategy: {}\n", card));
            }
            out.push_str(&format!("- Solution: {}\n", truncate(&entry.output, 300)));
        }
        out.push_str(&format!("\n## Current task\n{}\n", task));
        out
    }

    /// Store a new experience: summarize, embed, classify, deduplicate,
    /// append, prune to capacity, and persist in the background.
    pub async fn evolve(
        &self,
        input: &str,
        output: &str,
        feedback: &str,
        opts: EvolveOptions,
    ) -> Result<ExperienceEntry> {
        let summary = self.summarize_experience(input, output, feedback).await;
        let embedding = self.embedder.embed_one(input).await?;

        let mut entry = ExperienceEntry::new(input, output, feedback);
        entry.memory_type = classify_memory_type(&format!("{input} {output} {summary}"));
        entry.summary = summary;
        entry.embedding = embedding;
        entry.structured_feedback = opts.structured_feedback;
        entry.reasoning_trace = opts.reasoning_trace;
        entry.strategy_card = opts.strategy_card;

        {
            let mut entries = self.entries.write().await;

            if self.smart_prune {
                // Near-duplicates are absorbed into the new entry.
                let mut merged: Vec<String> = Vec::new();
                let threshold = self.config.prune_threshold;
                entries.retain(|existing| {
                    if existing.embedding.is_empty() {
                        return true;
                    }
                    let sim = cosine_similarity(&entry.embedding, &existing.embedding);
                    if sim >= threshold {
                        merged.push(existing.summary.clone());
                        false
                    } else {
                        true
                    }
                });
                if !merged.is_empty() {
                    debug!(count = merged.len(), "absorbed near-duplicate experiences");
                    entry
                        .metadata
                        .insert("merge_count".into(), serde_json::json!(merged.len()));
                    entry
                        .metadata
                        .insert("merged_from".into(), serde_json::json!(merged));
                }
            }

            entries.push(entry.clone());
            prune_to_capacity(
                &mut entries,
                &entry.id,
                self.config.max_size,
                self.smart_prune,
                self.config.decay_rate,
            );
        }

        self.persist_background().await;
        Ok(entry)
    }

    /// Apply a batch of controller-requested edits, then persist.
    pub async fn apply_edits(&self, edits: &[MemoryEdit]) -> Result<()> {
        for edit in edits {
            match edit.kind {
                MemoryEditKind::Prune => {
                    let mut entries = self.entries.write().await;
                    let before = entries.len();
                    entries.retain(|e| !edit.ids.contains(&e.id));
                    debug!(pruned = before - entries.len(), "prune edit applied");
                }
                MemoryEditKind::Merge => {
                    let Some(summary) = edit.new_summary.clone().filter(|s| !s.is_empty()) else {
                        warn!("merge edit without new_summary skipped");
                        continue;
                    };
                    let embedding = self.embedder.embed_one(&summary).await?;

                    let mut entries = self.entries.write().await;
                    let mut absorbed: Vec<ExperienceEntry> = Vec::new();
                    entries.retain(|e| {
                        if edit.ids.contains(&e.id) {
                            absorbed.push(e.clone());
                            false
                        } else {
                            true
                        }
                    });
                    if absorbed.is_empty() {
                        warn!("merge edit matched no entries");
                        continue;
                    }
                    let mut merged = ExperienceEntry::new(
                        absorbed[0].input.clone(),
                        absorbed[0].output.clone(),
                        "merged".to_string(),
                    );
                    merged.summary = summary;
                    merged.embedding = embedding;
                    merged.memory_type = absorbed[0].memory_type;
                    merged.metadata.insert(
                        "merged_from".into(),
                        serde_json::json!(edit.ids.clone()),
                    );
                    entries.push(merged);
                }
                MemoryEditKind::UpdateTag => {
                    let Some(tag) = &edit.tag else {
                        warn!("update_tag edit without tag skipped");
                        continue;
                    };
                    let mut entries = self.entries.write().await;
                    for entry in entries.iter_mut() {
                        if edit.ids.contains(&entry.id) {
                            entry.metadata.insert("tag".into(), serde_json::json!(tag));
                        }
                    }
                }
            }
        }
        self.persist_now().await;
        Ok(())
    }

    /// The last `window_size` entries, oldest first.
    pub async fn recent_window(&self) -> Vec<ExperienceEntry> {
        let entries = self.entries.read().await;
        let start = entries.len().saturating_sub(self.config.window_size);
        entries[start..].to_vec()
    }

    /// Numbered task/outcome list over the recent window.
    pub async fn build_recent_context(&self) -> String {
        let window = self.recent_window().await;
        if window.is_empty() {
            return String::new();
        }
        let mut out = String::from("Recent experiences:\n");
        for (i, entry) in window.iter().enumerate() {
            out.push_str(&format!(
                "{}. {} -> {}\n",
                i + 1,
                truncate(&entry.input, 120),
                entry.feedback
            ));
        }
        out
    }

    pub async fn stats(&self) -> ExperienceStats {
        let entries = self.entries.read().await;
        let mut stats = ExperienceStats {
            total: entries.len(),
            ..Default::default()
        };
        for entry in entries.iter() {
            match entry.memory_type {
                MemoryType::Factual => stats.factual += 1,
                MemoryType::Procedural => stats.procedural += 1,
                MemoryType::Episodic => stats.episodic += 1,
            }
        }
        stats
    }

    async fn summarize_experience(&self, input: &str, output: &str, feedback: &str) -> String {
        let req = ChatRequest::new(
            self.config.summary_model.clone(),
            vec![
                Message::system(EXPERIENCE_SUMMARIZER_SYSTEM),
                Message::user(format!(
                    "Task:\n{input}\n\nResult:\n{output}\n\nFeedback: {feedback}"
                )),
            ],
        )
        .with_max_tokens(256);

        match self.provider.chat(&req).await {
            Ok(reply) if !reply.content.trim().is_empty() => reply.content.trim().to_string(),
            Ok(_) => SUMMARY_FALLBACK.to_string(),
            Err(e) => {
                warn!(error = %e, "experience summarization failed");
                SUMMARY_FALLBACK.to_string()
            }
        }
    }

    /// Fire-and-forget snapshot save with its own short deadline.
    async fn persist_background(&self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let snapshot = self.entries.read().await.clone();
        let user_id = self.user_id.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(
                PERSIST_TIMEOUT,
                store.save(&user_id, &session_id, &snapshot),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "experience persistence failed"),
                Err(_) => warn!("experience persistence timed out"),
            }
        });
    }

    /// Synchronous (but still deadline-bounded) save, used after edits.
    async fn persist_now(&self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let snapshot = self.entries.read().await.clone();
        match tokio::time::timeout(
            PERSIST_TIMEOUT,
            store.save(&self.user_id, &self.session_id, &snapshot),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "experience persistence failed"),
            Err(_) => warn!("experience persistence timed out"),
        }
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    // Exact-vector duplicates must score exactly 1.0 — sqrt rounding would
    // otherwise leave them a hair under and defeat a 1.0 prune threshold.
    if a == b && a.iter().any(|x| *x != 0.0) {
        return 1.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

const PROCEDURAL_KEYWORDS: &[&str] = &[
    "how to", "steps", "procedure", "workflow", "strategy", "algorithm", "method", "approach",
    "technique", "process", "avoid", "pattern",
];

const FACTUAL_KEYWORDS: &[&str] = &["what is", "define", "value of", "answer is", "fact"];

/// Keyword heuristic over the concatenated input+output+summary,
/// case-insensitive substring match. Deliberately crude; an LLM-driven
/// classifier is the preferred future path.
pub fn classify_memory_type(text: &str) -> MemoryType {
    let lower = text.to_lowercase();
    if PROCEDURAL_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return MemoryType::Procedural;
    }
    if FACTUAL_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return MemoryType::Factual;
    }
    MemoryType::Episodic
}

/// Drop entries until the store fits `max_size`, never removing `keep_id`.
///
/// Smart path: decay every entry's relevance by age and access frequency,
/// drop the lowest, then restore temporal order. Plain path: FIFO.
fn prune_to_capacity(
    entries: &mut Vec<ExperienceEntry>,
    keep_id: &str,
    max_size: usize,
    smart: bool,
    decay_rate: f32,
) {
    if entries.len() <= max_size {
        return;
    }
    if smart {
        let now = chrono::Utc::now();
        for entry in entries.iter_mut() {
            let days = (now - entry.last_accessed_at).num_seconds().max(0) as f32 / 86_400.0;
            entry.relevance = entry.relevance
                * decay_rate.powf(days)
                * (1.0 + 0.1 * (1.0 + entry.access_count as f32).ln());
        }
        while entries.len() > max_size {
            let victim = entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.id != keep_id)
                .min_by(|a, b| {
                    a.1.relevance
                        .partial_cmp(&b.1.relevance)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, _)| i);
            match victim {
                Some(i) => {
                    entries.remove(i);
                }
                None => break,
            }
        }
        entries.sort_by_key(|e| e.created_at);
    } else {
        while entries.len() > max_size {
            if entries[0].id == keep_id {
                break;
            }
            entries.remove(0);
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let cut: String = s.chars().take(max_chars).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn cosine_of_identical_vectors_is_exactly_one() {
        let v = vec![0.3f32, 0.7, 0.648];
        assert_eq!(cosine_similarity(&v, &v), 1.0);
        // All-zero vectors stay at 0, not 1.
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn classifier_picks_procedural_first() {
        assert_eq!(
            classify_memory_type("how to deploy: steps one two"),
            MemoryType::Procedural
        );
        assert_eq!(
            classify_memory_type("what is the capital of France"),
            MemoryType::Factual
        );
        assert_eq!(
            classify_memory_type("we chatted about the weather"),
            MemoryType::Episodic
        );
    }

    #[test]
    fn fifo_prune_never_drops_newest() {
        let mut entries: Vec<ExperienceEntry> = (0..5)
            .map(|i| ExperienceEntry::new(format!("t{i}"), "o", "f"))
            .collect();
        let keep = entries.last().unwrap().id.clone();
        prune_to_capacity(&mut entries, &keep, 3, false, 0.99);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries.last().unwrap().id, keep);
        assert_eq!(entries[0].input, "t2");
    }

    #[test]
    fn smart_prune_drops_lowest_relevance_and_keeps_order() {
        let mut entries: Vec<ExperienceEntry> = (0..4)
            .map(|i| {
                let mut e = ExperienceEntry::new(format!("t{i}"), "o", "f");
                e.relevance = 1.0 + i as f32;
                e
            })
            .collect();
        let keep = entries.last().unwrap().id.clone();
        prune_to_capacity(&mut entries, &keep, 2, true, 0.99);
        assert_eq!(entries.len(), 2);
        // Lowest-relevance entries (t0, t1) were dropped, order restored.
        assert_eq!(entries[0].input, "t2");
        assert_eq!(entries[1].input, "t3");
    }

    #[test]
    fn smart_prune_protects_just_added_even_at_lowest_relevance() {
        let mut entries: Vec<ExperienceEntry> = (0..3)
            .map(|i| {
                let mut e = ExperienceEntry::new(format!("t{i}"), "o", "f");
                e.relevance = 10.0;
                e
            })
            .collect();
        let mut newest = ExperienceEntry::new("new", "o", "f");
        newest.relevance = 0.0;
        let keep = newest.id.clone();
        entries.push(newest);

        prune_to_capacity(&mut entries, &keep, 2, true, 0.99);
        assert!(entries.iter().any(|e| e.id == keep));
    }

    #[test]
    fn truncate_preserves_short_strings() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("0123456789abc", 10), "0123456789…");
    }
}
