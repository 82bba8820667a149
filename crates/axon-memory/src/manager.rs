//! Conversation memory manager — rolling summarization and tail selection.
//!
//! `build_context` turns a session's persisted history into the message
//! list for the next provider call. Old messages fold into a rolling
//! summary along two parallel paths — a plain text summary that any
//! provider can read, and a provider-native compaction blob when the
//! target provider supports one — persisted together in a dual envelope.
//! The raw tail is selected under a token budget and never splits an
//! assistant tool call from its responses.
//!
//! Summarizer failures never fail the turn; the manager falls back to
//! sending the full raw history.

use std::sync::Arc;

use tracing::{debug, info, warn};

use axon_core::config::MemoryConfig;
use axon_core::tokens::estimate_message_tokens;
use axon_core::types::{Message, Role};
use axon_provider::budget::context_size;
use axon_provider::tokenize::{count_tokens_cached, TokenCountCache};
use axon_provider::{ChatProvider, ChatRequest};

use crate::codec::{
    decode_compaction, decode_summary, encode_compaction, encode_content, encode_summary,
    SummaryEnvelope,
};
use crate::error::{MemoryError, Result};
use crate::store::ChatStore;

/// Compaction-mode milestone: summarize after this many unsummarized messages.
const MILESTONE_DELTA: usize = 6;
/// Compaction-mode milestone: summarize after this many unsummarized tool responses.
const MILESTONE_TOOL_RESPONSES: usize = 2;

const SUMMARY_PREFIX: &str = "Conversation summary (for context only):\n";

const CONTINUATION_RULE: &str = "The conversation so far has been compacted into an opaque \
state block. Treat it as authoritative prior context and continue the conversation naturally; \
do not mention the compaction.";

const SUMMARIZER_SYSTEM: &str = "You are a precise conversation summarizer.";

/// Stateless per-call context builder. Safe to share across requests; all
/// per-call data is stack-local and the store must be concurrency-safe.
pub struct ConversationMemoryManager {
    store: Arc<dyn ChatStore>,
    config: MemoryConfig,
    token_cache: Arc<TokenCountCache>,
}

impl ConversationMemoryManager {
    pub fn new(store: Arc<dyn ChatStore>, config: MemoryConfig) -> Self {
        Self {
            store,
            config,
            token_cache: Arc::new(TokenCountCache::default()),
        }
    }

    /// Persist one turn, encoding structured content for storage.
    pub async fn append(&self, user_id: &str, session_id: &str, msg: &Message) -> Result<()> {
        self.store.ensure_session(user_id, session_id).await?;
        self.store
            .append_message(user_id, session_id, msg.role, &encode_content(msg))
            .await
    }

    /// Build the bounded message list for the next provider call.
    pub async fn build_context(
        &self,
        provider: &dyn ChatProvider,
        user_id: &str,
        session_id: &str,
        model: &str,
    ) -> Result<Vec<Message>> {
        let stored = match self.store.list_messages(user_id, session_id, 0).await {
            Ok(msgs) => msgs,
            Err(MemoryError::NotFound { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };
        let session = match self.store.get_session(user_id, session_id).await {
            Ok(s) => s,
            Err(MemoryError::NotFound { .. }) => Default::default(),
            Err(e) => return Err(e),
        };

        let messages: Vec<Message> = stored.iter().map(crate::codec::rehydrate).collect();
        let total = messages.len();
        let mut envelope = decode_summary(&session.summary);
        let mut summarized_count = session.summarized_count.min(total);

        let compaction_mode = self.config.compaction && provider.compaction().is_some();

        let (context_window, known) = context_size(model);
        if !known {
            debug!(model, context_window, "using conservative context window");
        }
        let budget = context_window.saturating_sub(self.config.reserve_tokens).max(1_024) as usize;
        let estimated =
            count_tokens_cached(provider, &self.token_cache, &messages, model).await;

        let force = self.should_summarize(
            estimated,
            budget,
            total,
            summarized_count,
            &messages,
            compaction_mode,
        );

        let min_tail = if compaction_mode {
            0
        } else {
            self.config.min_keep_last
        };

        let mut summarize_failed = false;
        if force && total > min_tail {
            let target = repair_tool_boundary(&messages, total - min_tail);
            if target > summarized_count {
                let chunk = &messages[summarized_count..target];
                match self
                    .summarize_chunk(provider, chunk, &envelope, compaction_mode)
                    .await
                {
                    Some(updated) => {
                        envelope = updated;
                        summarized_count = target;
                        // Persist summary + count as a pair; a failed save is
                        // retried next cycle with the summary intact in memory.
                        if let Err(e) = self.persist_summary(
                            user_id,
                            session_id,
                            &envelope,
                            summarized_count,
                        )
                        .await
                        {
                            warn!(error = %e, session = session_id, "summary persist failed");
                        }
                    }
                    None => summarize_failed = true,
                }
            }
        }

        // Assemble: summary prefix, then the raw tail.
        let mut out: Vec<Message> = Vec::new();
        let mut tail_floor = summarized_count;
        let mut full_fallback = summarize_failed && envelope.is_empty();

        if compaction_mode {
            if let Some(handle) = decode_compaction(&envelope) {
                out.push(Message::system(CONTINUATION_RULE));
                out.push(Message::assistant("").with_compaction(handle));
            } else if let Some(plain) = envelope.plain.clone() {
                out.push(Message::system(format!("{SUMMARY_PREFIX}{plain}")));
            }
        } else if let Some(plain) = envelope.plain.clone() {
            out.push(Message::system(format!("{SUMMARY_PREFIX}{plain}")));
        } else if envelope.compaction.is_some() {
            // Only incompatible compaction data exists — the blob is useless
            // to this provider, so resend the full raw history.
            warn!(
                provider = provider.name(),
                session = session_id,
                "stored summary is compaction-only but provider lacks the capability"
            );
            tail_floor = 0;
            full_fallback = true;
        }

        let tail_start = if full_fallback {
            tail_floor
        } else {
            self.select_tail_start(&messages, budget, tail_floor)
        };
        out.extend_from_slice(&messages[tail_start..]);

        debug!(
            session = session_id,
            total,
            tail = total - tail_start,
            summarized = summarized_count,
            "context assembled"
        );
        Ok(out)
    }

    fn should_summarize(
        &self,
        estimated: usize,
        budget: usize,
        total: usize,
        summarized_count: usize,
        messages: &[Message],
        compaction_mode: bool,
    ) -> bool {
        if estimated > budget {
            return true;
        }
        if compaction_mode {
            // Milestone logic supersedes the count ceiling under compaction.
            let delta = total.saturating_sub(summarized_count);
            let tool_responses = messages[summarized_count.min(total)..]
                .iter()
                .filter(|m| m.role == Role::Tool)
                .count();
            return delta >= MILESTONE_DELTA || tool_responses >= MILESTONE_TOOL_RESPONSES;
        }
        total > self.config.max_keep_last
    }

    /// Run the compaction and plain summary paths over the chunk. Returns
    /// the updated envelope, or `None` when no path produced anything new.
    async fn summarize_chunk(
        &self,
        provider: &dyn ChatProvider,
        chunk: &[Message],
        previous: &SummaryEnvelope,
        compaction_mode: bool,
    ) -> Option<SummaryEnvelope> {
        let mut updated = previous.clone();
        let mut progressed = false;

        if compaction_mode {
            if let Some(cap) = provider.compaction() {
                let truncated = truncate_for_compaction(chunk, self.config.compaction_input_chars);
                let prev_handle = decode_compaction(previous);
                match cap
                    .compact(truncated, &self.config.summary_model, prev_handle.as_ref())
                    .await
                {
                    Ok(handle) => {
                        updated.compaction = Some(encode_compaction(&handle));
                        progressed = true;
                    }
                    Err(e) => warn!(error = %e, "compaction call failed"),
                }
            }
        }

        match self.plain_summary(provider, chunk, previous.plain.as_deref()).await {
            Ok(summary) => {
                updated.plain = Some(summary);
                progressed = true;
            }
            Err(e) => warn!(error = %e, "plain summarization failed"),
        }

        if progressed {
            info!(chunk = chunk.len(), "summary updated");
            Some(updated)
        } else {
            None
        }
    }

    async fn plain_summary(
        &self,
        provider: &dyn ChatProvider,
        chunk: &[Message],
        previous: Option<&str>,
    ) -> std::result::Result<String, MemoryError> {
        let transcript = render_transcript(chunk);
        let prompt = format!(
            "Summarize the conversation below for future context. Preserve goals, decisions, \
             identifiers, tool results, errors, and open questions. Stay under {} characters.\n\n\
             Previous summary:\n{}\n\nConversation:\n{}",
            self.config.summary_max_chars,
            previous.unwrap_or("(none)"),
            transcript,
        );
        let req = ChatRequest::new(
            self.config.summary_model.clone(),
            vec![Message::system(SUMMARIZER_SYSTEM), Message::user(prompt)],
        )
        .with_max_tokens(1_024);

        let reply = provider
            .chat(&req)
            .await
            .map_err(|e| MemoryError::Summarizer(e.to_string()))?;
        let summary = reply.content.trim().to_string();
        if summary.is_empty() {
            // An empty summary is a failure — the previous summary is kept.
            return Err(MemoryError::Summarizer(
                "summarizer returned empty content".to_string(),
            ));
        }
        Ok(summary)
    }

    async fn persist_summary(
        &self,
        user_id: &str,
        session_id: &str,
        envelope: &SummaryEnvelope,
        summarized_count: usize,
    ) -> Result<()> {
        self.store.ensure_session(user_id, session_id).await?;
        self.store
            .update_summary(
                user_id,
                session_id,
                &encode_summary(envelope),
                summarized_count,
            )
            .await
    }

    /// Walk backward from the end under the tail token budget (half the
    /// total budget), keeping at least `min_keep_last` and at most
    /// `max_keep_last` messages, never reaching below `floor`, and finally
    /// repairing any split tool chain.
    fn select_tail_start(&self, messages: &[Message], budget: usize, floor: usize) -> usize {
        let total = messages.len();
        let tail_budget = budget / 2;
        let mut start = total;
        let mut used = 0usize;

        while start > 0 {
            let cost = estimate_message_tokens(std::slice::from_ref(&messages[start - 1]));
            let kept = total - start;
            if kept >= self.config.min_keep_last {
                if kept >= self.config.max_keep_last || used + cost > tail_budget {
                    break;
                }
            }
            start -= 1;
            used += cost;
        }

        let start = start.max(total.saturating_sub(self.config.max_keep_last));
        let start = start.max(floor.min(total));
        repair_tool_boundary(messages, start)
    }
}

/// Move a split point backward until no tool-response message after it is
/// separated from the assistant message that issued the call.
fn repair_tool_boundary(messages: &[Message], mut boundary: usize) -> usize {
    loop {
        let mut moved = false;
        for msg in &messages[boundary..] {
            if msg.role != Role::Tool {
                continue;
            }
            let Some(call_id) = msg.tool_call_id.as_deref() else {
                continue;
            };
            let owner = messages[..boundary].iter().rposition(|m| {
                m.role == Role::Assistant && m.tool_calls.iter().any(|c| c.id == call_id)
            });
            if let Some(owner) = owner {
                boundary = owner;
                moved = true;
                break;
            }
        }
        if !moved {
            return boundary;
        }
    }
}

fn render_transcript(chunk: &[Message]) -> String {
    chunk
        .iter()
        .map(|m| {
            let mut line = format!("{}: {}", m.role.to_string().to_uppercase(), m.content);
            for call in &m.tool_calls {
                line.push_str(&format!("\n[tool_call {}({})]", call.name, call.args));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Keep the most recent span of the chunk that fits the compaction input
/// budget. Compaction folds the chunk into opaque state server-side; older
/// content past the budget is already covered by the previous blob.
fn truncate_for_compaction(chunk: &[Message], max_chars: usize) -> &[Message] {
    let mut chars = 0usize;
    let mut start = chunk.len();
    while start > 0 {
        let next = chunk[start - 1].content.chars().count();
        if chars + next > max_chars && start < chunk.len() {
            break;
        }
        chars += next;
        start -= 1;
    }
    &chunk[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_core::types::ToolCall;

    fn assistant_with_call(id: &str) -> Message {
        Message::assistant("").with_tool_calls(vec![ToolCall::new(
            id,
            "lookup",
            serde_json::json!({}),
        )])
    }

    #[test]
    fn boundary_moves_back_to_tool_call_owner() {
        let messages = vec![
            Message::user("q1"),
            assistant_with_call("call_a"),
            Message::tool("call_a", "r1"),
            Message::user("q2"),
        ];
        // Boundary at 2 would split call_a from its response.
        assert_eq!(repair_tool_boundary(&messages, 2), 1);
        // Boundary at 3 keeps the chain whole.
        assert_eq!(repair_tool_boundary(&messages, 3), 3);
    }

    #[test]
    fn boundary_without_tool_chain_is_stable() {
        let messages = vec![Message::user("a"), Message::assistant("b"), Message::user("c")];
        assert_eq!(repair_tool_boundary(&messages, 2), 2);
    }

    #[test]
    fn orphan_tool_response_does_not_loop() {
        let messages = vec![Message::tool("call_missing", "r"), Message::user("x")];
        assert_eq!(repair_tool_boundary(&messages, 0), 0);
    }

    #[test]
    fn compaction_truncation_keeps_recent_span() {
        let chunk = vec![
            Message::user("aaaaaaaaaa"),
            Message::user("bbbbbbbbbb"),
            Message::user("cccccccccc"),
        ];
        let kept = truncate_for_compaction(&chunk, 20);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].content, "bbbbbbbbbb");

        // A budget larger than the chunk keeps everything.
        assert_eq!(truncate_for_compaction(&chunk, 1000).len(), 3);
    }

    #[test]
    fn transcript_includes_tool_calls() {
        let rendered = render_transcript(&[assistant_with_call("call_1")]);
        assert!(rendered.contains("[tool_call lookup"));
    }
}
