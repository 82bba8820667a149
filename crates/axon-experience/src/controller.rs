//! Think–Refine–Act controller.
//!
//! An inner loop where the model alternates private reasoning (THINK),
//! memory editing (REFINE_MEMORY), and a final answer (ACT), driven by
//! strict-JSON responses. Malformed responses degrade gracefully: the raw
//! content is treated as a final ACT.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use axon_core::types::Message;
use axon_provider::{ChatProvider, ChatRequest};

use crate::error::Result;
use crate::memory::ExperienceMemory;
use crate::types::{EvolveOptions, ExperienceEntry, MemoryEdit};

const TRA_SYSTEM: &str = r#"You are a deliberate problem solver with an editable experience memory.
Respond with a single JSON object, nothing else, matching:
{"action":"THINK"|"REFINE_MEMORY"|"ACT","content":"...","memory_edits":[{"type":"PRUNE"|"MERGE"|"UPDATE_TAG","ids":["..."],"new_summary":"...","tag":"..."}]}
THINK records private reasoning and continues.
REFINE_MEMORY applies memory_edits, then continues.
ACT gives the final answer in content and ends the task."#;

#[derive(Debug, Deserialize)]
struct TraResponse {
    action: TraAction,
    #[serde(default)]
    content: String,
    #[serde(default)]
    memory_edits: Vec<MemoryEdit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum TraAction {
    Think,
    RefineMemory,
    Act,
}

/// Result of one controller run.
#[derive(Debug, Clone)]
pub struct TraOutcome {
    pub answer: String,
    /// THINK and [REFINE] entries accumulated along the way.
    pub trace: Vec<String>,
}

pub struct TraController {
    provider: Arc<dyn ChatProvider>,
    memory: Arc<ExperienceMemory>,
    model: String,
    max_inner_steps: usize,
}

impl TraController {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        memory: Arc<ExperienceMemory>,
        model: impl Into<String>,
        max_inner_steps: usize,
    ) -> Self {
        Self {
            provider,
            memory,
            model: model.into(),
            max_inner_steps: max_inner_steps.max(1),
        }
    }

    /// Drive the loop for one task. LLM errors abort with the error;
    /// memory-edit errors are logged and the loop continues.
    pub async fn run(&self, task: &str) -> Result<TraOutcome> {
        let mut retrieved = self.memory.search(task).await?;
        let mut trace: Vec<String> = Vec::new();

        for step in 0..self.max_inner_steps {
            let prompt = build_prompt(task, &retrieved, &trace);
            let req = ChatRequest::new(
                self.model.clone(),
                vec![Message::system(TRA_SYSTEM), Message::user(prompt)],
            );
            let reply = self.provider.chat(&req).await?;

            let Some(parsed) = parse_response(&reply.content) else {
                // Graceful degradation: raw content is the final answer.
                debug!(step, "unparseable controller response, degrading to ACT");
                let outcome = TraOutcome {
                    answer: reply.content.trim().to_string(),
                    trace,
                };
                self.record_episode(task, &outcome).await;
                return Ok(outcome);
            };

            match parsed.action {
                TraAction::Think => {
                    debug!(step, "THINK");
                    trace.push(parsed.content);
                }
                TraAction::RefineMemory => {
                    debug!(step, edits = parsed.memory_edits.len(), "REFINE_MEMORY");
                    if let Err(e) = self.memory.apply_edits(&parsed.memory_edits).await {
                        warn!(error = %e, "memory edit failed, continuing");
                    }
                    retrieved = self.memory.search(task).await?;
                    trace.push(format!("[REFINE] {}", parsed.content));
                }
                TraAction::Act => {
                    info!(step, "ACT");
                    let outcome = TraOutcome {
                        answer: parsed.content,
                        trace,
                    };
                    self.record_episode(task, &outcome).await;
                    return Ok(outcome);
                }
            }
        }

        // Budget exhausted: the last trace entry stands in for the answer.
        let answer = trace.last().cloned().unwrap_or_default();
        Ok(TraOutcome { answer, trace })
    }

    async fn record_episode(&self, task: &str, outcome: &TraOutcome) {
        let opts = EvolveOptions {
            reasoning_trace: if outcome.trace.is_empty() {
                None
            } else {
                Some(outcome.trace.join("\n"))
            },
            ..Default::default()
        };
        if let Err(e) = self
            .memory
            .evolve(task, &outcome.answer, "success", opts)
            .await
        {
            warn!(error = %e, "failed to evolve completed episode");
        }
    }
}

fn build_prompt(task: &str, retrieved: &[(ExperienceEntry, f32)], trace: &[String]) -> String {
    let mut prompt = ExperienceMemory::synthesize(task, retrieved);
    if !trace.is_empty() {
        prompt.push_str("\n## Reasoning so far\n");
        for (i, entry) in trace.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", i + 1, entry));
        }
    }
    prompt
}

/// Extract and parse the JSON object from a model reply that may wrap it
/// in prose or a code fence.
fn parse_response(raw: &str) -> Option<TraResponse> {
    let trimmed = raw.trim();
    let json_str = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    };
    serde_json::from_str(json_str).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_json() {
        let parsed = parse_response(r#"{"action":"ACT","content":"42"}"#).unwrap();
        assert_eq!(parsed.action, TraAction::Act);
        assert_eq!(parsed.content, "42");
        assert!(parsed.memory_edits.is_empty());
    }

    #[test]
    fn parses_fenced_json() {
        let raw = "Here you go:\n```json\n{\"action\":\"THINK\",\"content\":\"hmm\"}\n```";
        let parsed = parse_response(raw).unwrap();
        assert_eq!(parsed.action, TraAction::Think);
    }

    #[test]
    fn rejects_non_json() {
        assert!(parse_response("just some prose").is_none());
        assert!(parse_response(r#"{"action":"DANCE","content":"x"}"#).is_none());
    }

    #[test]
    fn parses_memory_edits() {
        let raw = r#"{"action":"REFINE_MEMORY","content":"cleanup",
            "memory_edits":[{"type":"PRUNE","ids":["a"]}]}"#;
        let parsed = parse_response(raw).unwrap();
        assert_eq!(parsed.action, TraAction::RefineMemory);
        assert_eq!(parsed.memory_edits.len(), 1);
    }
}
